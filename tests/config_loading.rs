// tests/config_loading.rs

use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::sync::oneshot;

use acm_test_utils::builders::{ConfigFileBuilder, SenderBuilder};
use acm_test_utils::init_tracing;
use epics_acm::channel::{ApplyResponse, SimulatedChannelService};
use epics_acm::config::{load_and_validate, ConfigFile};
use epics_acm::errors::CommandError;
use epics_acm::{simulate_post, CommandSender, CommandState, ListenerDispatcher, Value, ValueKind};

type TestResult = Result<(), Box<dyn Error>>;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn expect_config_error(contents: &str) -> String {
    let file = write_config(contents);
    match load_and_validate(file.path()) {
        Err(CommandError::ConfigError(msg)) => msg,
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn record_names_expand_to_standard_fields() -> TestResult {
    let file = write_config(
        r#"
[defaults]
connect_timeout = "5s"
write_timeout = "2s"
command_timeout = "60s"

[sender.applyGmos]
description = "GMOS observe"
apply = "gmos:apply"
car = "gmos:applyC"
command_timeout = "120s"

[sender.applyGmos.parameter.exposureTime]
channel = "gmos:expTime"
type = "double"
description = "exposure time in seconds"

[sender.applyGmos.parameter.coadds]
channel = "gmos:coadds"
type = "integer"
"#,
    );

    let cfg = load_and_validate(file.path())?;
    let gmos = cfg.sender("applyGmos").expect("sender present");

    assert_eq!(gmos.description, "GMOS observe");
    assert_eq!(gmos.apply.directive, "gmos:apply.DIR");
    assert_eq!(gmos.apply.mark, "gmos:apply.DIR");
    assert_eq!(gmos.apply.status, "gmos:applyC.VAL");
    assert_eq!(gmos.apply.message.as_deref(), Some("gmos:applyC.OMSS"));

    assert_eq!(gmos.config.connect_timeout, Duration::from_secs(5));
    assert_eq!(gmos.config.write_timeout, Duration::from_secs(2));
    assert_eq!(gmos.config.command_timeout, Duration::from_secs(120));

    let exposure = &gmos.parameters["exposureTime"];
    assert_eq!(exposure.kind, ValueKind::Double);
    assert_eq!(exposure.channel, "gmos:expTime");
    assert_eq!(exposure.description.as_deref(), Some("exposure time in seconds"));
    assert_eq!(gmos.parameters["coadds"].kind, ValueKind::Integer);
    Ok(())
}

#[test]
fn explicit_channels_without_message() -> TestResult {
    let file = write_config(
        r#"
[sender.applyTcs]
directive = "tcs:apply.DIR"
mark = "tcs:apply.MARK"
status = "tcs:applyC.VAL"
"#,
    );

    let cfg = load_and_validate(file.path())?;
    let tcs = cfg.sender("applyTcs").expect("sender present");

    assert_eq!(tcs.apply.directive, "tcs:apply.DIR");
    assert_eq!(tcs.apply.mark, "tcs:apply.MARK");
    assert_eq!(tcs.apply.message, None);
    assert_eq!(tcs.description, "");
    assert_eq!(tcs.config, epics_acm::SenderConfig::default());
    Ok(())
}

#[test]
fn explicit_channel_overrides_record_expansion() -> TestResult {
    let file = write_config(
        r#"
[sender.applyAg]
apply = "ag:apply"
car = "ag:applyC"
message = "ag:applyC.MESS"
"#,
    );

    let cfg = load_and_validate(file.path())?;
    let ag = cfg.sender("applyAg").expect("sender present");
    assert_eq!(ag.apply.status, "ag:applyC.VAL");
    assert_eq!(ag.apply.message.as_deref(), Some("ag:applyC.MESS"));
    Ok(())
}

#[test]
fn empty_config_is_rejected() {
    let msg = expect_config_error("");
    assert!(msg.contains("at least one"));
}

#[test]
fn apply_without_car_is_rejected() {
    let msg = expect_config_error(
        r#"
[sender.broken]
apply = "x:apply"
"#,
    );
    assert!(msg.contains("broken"));
}

#[test]
fn missing_status_channel_is_rejected() {
    let msg = expect_config_error(
        r#"
[sender.broken]
directive = "x:apply.DIR"
"#,
    );
    assert!(msg.contains("directive` + `status"));
}

#[test]
fn invalid_channel_name_is_rejected() {
    let msg = expect_config_error(
        r#"
[sender.applyGmos]
apply = "gmos:apply"
car = "gmos:applyC"

[sender.applyGmos.parameter.exposureTime]
channel = "gmos exp time"
type = "double"
"#,
    );
    assert!(msg.contains("exposureTime"));
    assert!(msg.contains("not a valid channel name"));
}

#[test]
fn zero_and_malformed_durations_are_rejected() {
    let msg = expect_config_error(
        r#"
[defaults]
command_timeout = "0s"

[sender.a]
apply = "a:apply"
car = "a:applyC"
"#,
    );
    assert!(msg.contains("greater than zero"));

    let msg = expect_config_error(
        r#"
[sender.a]
apply = "a:apply"
car = "a:applyC"
write_timeout = "2 days"
"#,
    );
    assert!(msg.contains("[sender.a].write_timeout"));
}

#[test]
fn unknown_parameter_type_is_a_toml_error() {
    let file = write_config(
        r#"
[sender.a]
apply = "a:apply"
car = "a:applyC"

[sender.a.parameter.x]
channel = "a:x"
type = "long"
"#,
    );

    assert!(matches!(
        load_and_validate(file.path()),
        Err(CommandError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(matches!(
        load_and_validate(&path),
        Err(CommandError::IoError(_))
    ));
}

fn gmos_config() -> ConfigFile {
    ConfigFileBuilder::new()
        .with_default_command_timeout("10s")
        .with_sender(
            "applyGmos",
            SenderBuilder::records("gmos:apply", "gmos:applyC")
                .description("GMOS observe")
                .parameter("exposureTime", "gmos:expTime", ValueKind::Double)
                .parameter("coadds", "gmos:coadds", ValueKind::Integer)
                .build(),
        )
        .build()
}

#[tokio::test(start_paused = true)]
async fn sender_is_built_from_its_definition() -> TestResult {
    init_tracing();
    let cfg = gmos_config();
    let definition = cfg.sender("applyGmos").expect("sender present");

    let sim = SimulatedChannelService::new();
    sim.install_apply_record(
        &definition.apply.directive,
        &definition.apply.status,
        definition.apply.message.as_deref(),
        ApplyResponse::Succeed {
            after: Duration::from_secs(1),
        },
    );

    let sender = CommandSender::from_definition(
        definition,
        Arc::new(sim.clone()),
        ListenerDispatcher::spawn("acm-dispatch")?,
    )
    .await?;

    assert_eq!(sender.name(), "applyGmos");
    assert_eq!(sender.description(), "GMOS observe");
    assert_eq!(sender.config().command_timeout, Duration::from_secs(10));
    assert_eq!(sender.parameter_names().await.len(), 2);

    sender
        .get_double("exposureTime")
        .await
        .expect("registered from config")
        .set(5.0);
    let monitor = sender.post_wait().await?;

    assert_eq!(monitor.state(), CommandState::Success);
    assert_eq!(sim.writes_to("gmos:expTime"), vec![Value::Double(5.0)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn simulated_post_applies_assignments() -> TestResult {
    init_tracing();
    let cfg = gmos_config();
    let definition = cfg.sender("applyGmos").expect("sender present");
    let (_cancel_tx, cancel_rx) = oneshot::channel();

    let assignments = vec![
        ("exposureTime".to_string(), "30".to_string()),
        ("coadds".to_string(), "2".to_string()),
    ];
    let monitor = simulate_post(definition, &assignments, Duration::from_millis(100), cancel_rx).await?;

    assert_eq!(monitor.state(), CommandState::Success);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn simulated_post_rejects_bad_assignments() {
    init_tracing();
    let cfg = gmos_config();
    let definition = cfg.sender("applyGmos").expect("sender present");

    let (_tx, rx) = oneshot::channel();
    let unknown = vec![("binning".to_string(), "2".to_string())];
    let err = simulate_post(definition, &unknown, Duration::from_millis(10), rx)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ParameterNotFound(_)));

    let (_tx, rx) = oneshot::channel();
    let malformed = vec![("coadds".to_string(), "two".to_string())];
    let err = simulate_post(definition, &malformed, Duration::from_millis(10), rx)
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        CommandError::InvalidLiteral { kind: ValueKind::Integer, text, .. } if text == "two"
    ));
}
