use crate::Error;
use crate::WatcherConfig;

#[test]
fn defaults_are_valid() {
    let config = WatcherConfig::default();
    assert_eq!(config.aggregate_buffer, 32);
    assert!(config.validate().is_ok());
}

#[test]
fn load_without_file_yields_defaults() {
    let config = WatcherConfig::load(None).expect("defaults load");
    assert_eq!(config, WatcherConfig::default());
}

#[test]
fn zero_capacity_is_rejected() {
    let config = WatcherConfig {
        aggregate_buffer: 0,
    };
    assert!(matches!(config.validate(), Err(Error::Config(_))));
}
