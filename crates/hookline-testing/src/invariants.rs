//! Store invariants every test can assert after any sequence of operations.

use anyhow::{ensure, Context, Result};
use hookline_core::{DeadLetterSink, DedupKey, EventState, EventStore};

/// Checks the lifecycle invariants for each of `keys`:
///
/// - a lease token is present exactly while the record is `InFlight`
/// - `attempt_count` equals the length of the attempt history, numbered 1..=n
/// - a `Dead` record has a dead-letter entry with the same attempt count
pub async fn assert_store_invariants<S>(store: &S, keys: &[DedupKey]) -> Result<()>
where
    S: EventStore + DeadLetterSink,
{
    for key in keys {
        let record = store.get(key).await?.with_context(|| format!("missing record {key}"))?;

        let leased = record.lease_token.is_some() && record.lease_expires_at.is_some();
        ensure!(
            leased == (record.state == EventState::InFlight),
            "{key}: lease present = {leased} in state {}",
            record.state
        );

        let attempts = store.attempts(key).await?;
        ensure!(
            attempts.len() == record.attempt_count as usize,
            "{key}: attempt_count {} but {} attempts recorded",
            record.attempt_count,
            attempts.len()
        );
        for (index, attempt) in attempts.iter().enumerate() {
            ensure!(attempt.attempt as usize == index + 1, "{key}: attempts out of order");
        }

        if record.state == EventState::Dead {
            let entry = store
                .dead_letter(key)
                .await?
                .with_context(|| format!("{key}: dead without dead-letter entry"))?;
            ensure!(
                entry.attempt_count == record.attempt_count,
                "{key}: dead-letter attempt_count {} != record {}",
                entry.attempt_count,
                record.attempt_count
            );
        }
    }
    Ok(())
}
