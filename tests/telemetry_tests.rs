//! Subscriber installation. Kept in its own binary: the global subscriber
//! can be set once per process.

#[test]
fn json_subscriber_installs_once_per_process() {
    assert!(courier::init_json_tracing(false));
    assert!(!courier::init_json_tracing(true));
    assert!(!courier::init_tracing(false));
}
