//! Bounded read-modify-CAS combinator

use crate::error::StoreError;
use crate::traits::{Fields, SecretStore, Versioned, ABSENT_VERSION};
use log::debug;

/// Outcome of one mutation attempt
#[derive(Debug)]
pub enum CasStep<T> {
    /// Persist `Fields` with compare-and-swap, then yield `T`
    Write(Fields, T),
    /// Leave the document untouched and yield `T`
    Keep(T),
}

/// Read `path`, apply `mutate`, and write the result with compare-and-swap.
///
/// On a version conflict all work is discarded and the whole read-mutate-write
/// cycle restarts, at most `max_attempts` times in total. `mutate` sees the
/// current document (or `None`) and may abort the update by returning an error.
/// Resolves to the mutation's value and the document version after the update.
pub async fn compare_and_swap_update<S, T, E, F>(
    store: &S,
    path: &str,
    max_attempts: u32,
    mut mutate: F,
) -> Result<(T, u64), E>
where
    S: SecretStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(Option<&Versioned>) -> Result<CasStep<T>, E>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let current = store.get(path).await?;
        let expected = current.as_ref().map_or(ABSENT_VERSION, |doc| doc.version);

        match mutate(current.as_ref())? {
            CasStep::Keep(value) => return Ok((value, expected)),
            CasStep::Write(fields, value) => match store.put(path, fields, expected).await {
                Ok(version) => return Ok((value, version)),
                Err(err) if err.is_conflict() => {
                    debug!("CAS conflict on {path} (attempt {attempt}/{max_attempts})");
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err.into()),
            },
        }
    }

    Err(StoreError::ContentionExhausted {
        path: path.to_string(),
        attempts: max_attempts,
    }
    .into())
}
