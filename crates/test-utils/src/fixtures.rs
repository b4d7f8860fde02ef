#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use epics_acm::channel::{ApplyResponse, SimulatedChannelService};
use epics_acm::{ApplyChannels, CommandSender, SenderConfig};

pub const GMOS_APPLY: &str = "gmos:apply";
pub const GMOS_CAR: &str = "gmos:applyC";

/// A sender connected to a simulated apply record.
pub struct SimFixture {
    pub sim: SimulatedChannelService,
    pub sender: CommandSender,
    pub apply: ApplyChannels,
}

/// `applyGmos` on `gmos:apply` / `gmos:applyC`, answering `START` with
/// `response`.
pub async fn gmos_sender(response: ApplyResponse, config: SenderConfig) -> SimFixture {
    let sim = SimulatedChannelService::new();
    let apply = ApplyChannels::from_records(GMOS_APPLY, GMOS_CAR);
    sender_on(sim, "applyGmos", apply, response, config).await
}

/// Install an apply record for `apply` on `sim` and connect a sender to it.
pub async fn sender_on(
    sim: SimulatedChannelService,
    name: &str,
    apply: ApplyChannels,
    response: ApplyResponse,
    config: SenderConfig,
) -> SimFixture {
    sim.install_apply_record(
        &apply.directive,
        &apply.status,
        apply.message.as_deref(),
        response,
    );

    let sender = CommandSender::connect(
        name,
        "test sender",
        apply.clone(),
        Arc::new(sim.clone()),
        config,
    )
    .await
    .expect("sender connects to simulated channels");

    SimFixture { sim, sender, apply }
}

/// Timeouts short enough for real-clock tests.
pub fn fast_config() -> SenderConfig {
    SenderConfig {
        connect_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_millis(200),
        command_timeout: Duration::from_secs(2),
    }
}

pub fn succeed_after(ms: u64) -> ApplyResponse {
    ApplyResponse::Succeed {
        after: Duration::from_millis(ms),
    }
}
