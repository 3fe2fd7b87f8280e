//! H3-versus-H2 protocol racing.
//!
//! Both dials run in parallel; the first branch to produce response
//! headers wins and the loser is cancelled. Cancellation aborts the losing
//! task, whose pool guard releases its claimed dial slot; nothing but the
//! support and session caches observe the losing branch.

use std::future::Future;

use crate::error::{Error, Result};
use crate::response::Response;

/// Outcome of a race.
pub enum RaceOutcome {
    H3(Response),
    H2(Response),
    BothFailed { h3: Error, h2: Error },
}

/// Race an H3 attempt against an H2 attempt.
///
/// The winner is committed only once its `Response` resolves, which for
/// both transports means response headers have arrived; a QUIC path that
/// connects but never answers cannot lock out H2.
pub async fn race<F3, F2>(h3: F3, h2: F2) -> RaceOutcome
where
    F3: Future<Output = Result<Response>> + Send + 'static,
    F2: Future<Output = Result<Response>> + Send + 'static,
{
    let mut h3_task = tokio::spawn(h3);
    let mut h2_task = tokio::spawn(h2);
    let mut h3_err: Option<Error> = None;
    let mut h2_err: Option<Error> = None;

    loop {
        tokio::select! {
            joined = &mut h3_task, if h3_err.is_none() => {
                match flatten(joined, "h3") {
                    Ok(resp) => {
                        h2_task.abort();
                        return RaceOutcome::H3(resp);
                    }
                    Err(e) => h3_err = Some(e),
                }
            }
            joined = &mut h2_task, if h2_err.is_none() => {
                match flatten(joined, "h2") {
                    Ok(resp) => {
                        h3_task.abort();
                        return RaceOutcome::H2(resp);
                    }
                    Err(e) => h2_err = Some(e),
                }
            }
        }

        if let (Some(_), Some(_)) = (&h3_err, &h2_err) {
            return RaceOutcome::BothFailed {
                h3: h3_err.expect("checked"),
                h2: h2_err.expect("checked"),
            };
        }
    }
}

fn flatten(
    joined: std::result::Result<Result<Response>, tokio::task::JoinError>,
    protocol: &'static str,
) -> Result<Response> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::network("race", format!("race branch failed: {}", e))
            .with_protocol(protocol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderMap;
    use crate::response::ResponseBody;
    use std::time::Duration;

    fn response(protocol: &'static str) -> Response {
        Response::new(
            200,
            HeaderMap::new(),
            ResponseBody::empty(),
            "https://example.com/".to_string(),
            protocol,
        )
    }

    #[tokio::test]
    async fn test_faster_branch_wins() {
        let outcome = race(
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(response("h3"))
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(response("h2"))
            },
        )
        .await;
        assert!(matches!(outcome, RaceOutcome::H3(_)));
    }

    #[tokio::test]
    async fn test_slow_winner_beats_fast_failure() {
        let outcome = race(
            async { Err(Error::network("dial", "udp blocked")) },
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(response("h2"))
            },
        )
        .await;
        assert!(matches!(outcome, RaceOutcome::H2(_)));
    }

    #[tokio::test]
    async fn test_both_failing_reports_both() {
        let outcome = race(
            async { Err(Error::network("dial", "h3 down")) },
            async { Err(Error::protocol("alpn", "no h2")) },
        )
        .await;
        match outcome {
            RaceOutcome::BothFailed { h3, h2 } => {
                assert!(h3.to_string().contains("h3 down"));
                assert!(h2.is_protocol_class());
            }
            _ => panic!("expected BothFailed"),
        }
    }
}
