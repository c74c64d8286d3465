use ibsim_macros::test_traced;
use tracing::{debug, error, info};

#[test_traced("INFO")]
fn test_info_level() {
    info!("This is an info log");
    debug!("This is a debug log (won't be shown)");
    assert_eq!(2 + 2, 4);
}

#[test_traced]
fn test_default_level() {
    debug!("This is a debug log");
    assert_eq!(3 * 3, 9);
}

#[test_traced("error")]
fn test_error_level() {
    error!("This is an error log");
    assert_eq!(5 * 2, 10);
}

#[test_traced]
fn test_spawned_thread_logs() {
    let handle = std::thread::Builder::new()
        .name("worker".into())
        .spawn(|| {
            info!("logged from a spawned thread");
            7
        })
        .unwrap();
    assert_eq!(handle.join().unwrap(), 7);
}

#[test_traced]
#[should_panic(expected = "boom")]
fn test_should_panic_passthrough() {
    panic!("boom");
}
