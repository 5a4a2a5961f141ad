//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use aria_relay::pipeline::Supervisor;
use aria_relay::types::PipelineState;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Wait until the supervisor's state matches `predicate`
pub async fn wait_for_state(
    supervisor: &Supervisor,
    predicate: impl FnMut(&PipelineState) -> bool,
) -> PipelineState {
    let mut state = supervisor.subscribe_state();
    let result = tokio::time::timeout(test_timeout(), state.wait_for(predicate)).await;
    match result {
        Ok(Ok(state)) => state.clone(),
        Ok(Err(_)) => panic!("state channel closed"),
        Err(_) => panic!("timed out waiting, state is {:?}", supervisor.state()),
    }
}

/// Poll `condition` until it holds or the test timeout elapses
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + test_timeout();
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            test_timeout()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
