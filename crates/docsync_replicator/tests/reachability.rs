//! The process-wide reachability signal. Kept in its own test binary so
//! the global signal does not disturb other tests.

use docsync_replicator::{
    active_sessions, notify_network_reachable, ActivityLevel, MockTransportFactory, Replicator,
    ReplicatorConfig,
};
use docsync_testkit::{init_logging, wait_until, StatusRecorder, TestDatabase};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn reachability_reaches_every_offline_session() {
    init_logging();
    let db = TestDatabase::memory();
    let config = ReplicatorConfig::new()
        .with_continuous(true)
        .with_poll_interval(Duration::from_millis(5));

    let sessions: Vec<_> = (0..2)
        .map(|_| {
            let factory = Arc::new(MockTransportFactory::unreachable());
            let replicator = Replicator::new(db.handle(), factory.clone(), config.clone());
            let (recorder, _token) = StatusRecorder::attach(&replicator);
            replicator.start().unwrap();
            (replicator, factory, recorder)
        })
        .collect();

    for (_, _, recorder) in &sessions {
        assert!(recorder.wait_for(ActivityLevel::Offline, 1, WAIT));
    }
    assert_eq!(active_sessions(), 2);

    notify_network_reachable();
    for (_, factory, recorder) in &sessions {
        assert!(recorder.wait_for(ActivityLevel::Offline, 2, WAIT));
        assert_eq!(factory.open_count(), 2);
    }

    for (replicator, _, recorder) in &sessions {
        replicator.stop();
        assert!(recorder.wait_stopped(WAIT));
    }
    assert!(wait_until(WAIT, || active_sessions() == 0));

    // Nothing is registered, so this is a no-op.
    notify_network_reachable();
}
