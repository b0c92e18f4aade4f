//! Retry and redirect control around a single (proxy kind, target URL) probe.

use std::{future::Future, time::Duration};

use tokio::time::sleep;

use crate::{
    config::ScanConfig,
    probe::{self, HeaderSet, ProbeOutcome, ProxyKind},
};

/// How redirects are resolved for a proxy kind. The HTTP-family and SOCKS5
/// clients follow one hop internally; the SOCKS4/4A client hands the
/// Location back, and the controller loops it with a bounded budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    FollowOnce,
    CallerLoop { max: usize },
}

pub fn redirect_mode(kind: ProxyKind) -> RedirectMode {
    match kind {
        ProxyKind::Http | ProxyKind::Https | ProxyKind::Socks5 => RedirectMode::FollowOnce,
        ProxyKind::Socks4 | ProxyKind::Socks4a => RedirectMode::CallerLoop { max: 5 },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts(),
            delay: cfg.retry_delay(),
        }
    }
}

/// Drives `probe_fn` until it succeeds or the attempt budget is spent.
///
/// In `CallerLoop` mode a successful outcome carrying a redirect URL
/// continues the *same* attempt against the new URL; a failure at any hop
/// burns the attempt and falls through to the next one after the delay.
/// Per-attempt diagnostics are not retained past the attempt; exhaustion
/// yields one synthesized message naming the attempt count.
pub async fn run<F, Fut>(
    policy: &RetryPolicy,
    mode: RedirectMode,
    url: &str,
    mut probe_fn: F,
) -> (bool, String)
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ProbeOutcome>,
{
    for attempt in 1..=policy.max_attempts {
        match mode {
            RedirectMode::FollowOnce => {
                let outcome = probe_fn(url.to_string()).await;
                if outcome.ok {
                    return (true, outcome.detail);
                }
                log::debug!("attempt {} failed: {}", attempt, outcome.detail);
            }
            RedirectMode::CallerLoop { max } => {
                let mut current = url.to_string();
                for _hop in 0..=max {
                    let outcome = probe_fn(current.clone()).await;
                    if !outcome.ok {
                        log::debug!("attempt {} failed: {}", attempt, outcome.detail);
                        break;
                    }
                    match outcome.redirect {
                        None => return (true, outcome.detail),
                        Some(location) => current = location,
                    }
                }
            }
        }
        if attempt < policy.max_attempts && !policy.delay.is_zero() {
            sleep(policy.delay).await;
        }
    }
    (
        false,
        format!("still failing after {} attempts", policy.max_attempts),
    )
}

/// Content-validating probe of `url` through the candidate proxy, with the
/// configured retry policy and the kind's redirect capability.
pub async fn visit(
    cfg: &ScanConfig,
    kind: ProxyKind,
    host: &str,
    port: u16,
    url: &str,
    headers: &HeaderSet,
) -> (bool, String) {
    visit_with_mode(cfg, kind, host, port, url, headers, cfg.validate_content, false).await
}

/// Raw-mode probe: the body comes back verbatim on 200/302. Used for
/// egress-IP discovery.
pub async fn visit_raw(
    cfg: &ScanConfig,
    kind: ProxyKind,
    host: &str,
    port: u16,
    url: &str,
    headers: &HeaderSet,
) -> (bool, String) {
    visit_with_mode(cfg, kind, host, port, url, headers, true, true).await
}

#[allow(clippy::too_many_arguments)]
async fn visit_with_mode(
    cfg: &ScanConfig,
    kind: ProxyKind,
    host: &str,
    port: u16,
    url: &str,
    headers: &HeaderSet,
    validate: bool,
    raw: bool,
) -> (bool, String) {
    let policy = RetryPolicy::from_config(cfg);
    run(&policy, redirect_mode(kind), url, move |current| async move {
        probe::visit_once(cfg, kind, host, port, &current, headers, validate, raw).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn zero_delay(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn always_failing_probe_exhausts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (ok, detail) = run(
            &zero_delay(3),
            RedirectMode::FollowOnce,
            "http://x/",
            move |_url| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProbeOutcome::fail("nope")
                }
            },
        )
        .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(detail.contains('3'), "message must cite the attempt count");
    }

    #[tokio::test]
    async fn returns_on_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (ok, detail) = run(
            &zero_delay(5),
            RedirectMode::FollowOnce,
            "http://x/",
            move |_url| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                        ProbeOutcome::ok("done")
                    } else {
                        ProbeOutcome::fail("nope")
                    }
                }
            },
        )
        .await;
        assert!(ok);
        assert_eq!(detail, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn caller_loop_walks_redirect_chain() {
        let urls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&urls);
        let (ok, detail) = run(
            &zero_delay(1),
            RedirectMode::CallerLoop { max: 5 },
            "http://a/",
            move |url| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(url.clone());
                    if url == "http://a/" {
                        ProbeOutcome::redirect("302", "http://b/")
                    } else {
                        ProbeOutcome::ok("landed")
                    }
                }
            },
        )
        .await;
        assert!(ok);
        assert_eq!(detail, "landed");
        assert_eq!(*urls.lock().unwrap(), vec!["http://a/", "http://b/"]);
    }

    #[tokio::test]
    async fn endless_redirects_burn_the_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (ok, _) = run(
            &zero_delay(2),
            RedirectMode::CallerLoop { max: 5 },
            "http://a/",
            move |_url| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProbeOutcome::redirect("302", "http://a/")
                }
            },
        )
        .await;
        assert!(!ok);
        // 6 hops per attempt (initial request + 5 redirects), two attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn redirect_hop_failure_falls_to_next_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (ok, detail) = run(
            &zero_delay(2),
            RedirectMode::CallerLoop { max: 5 },
            "http://a/",
            move |url| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if url == "http://a/" && n < 2 {
                        ProbeOutcome::redirect("302", "http://broken/")
                    } else if url == "http://broken/" {
                        ProbeOutcome::fail("dead hop")
                    } else {
                        ProbeOutcome::ok("ok")
                    }
                }
            },
        )
        .await;
        // attempt 1: a -> broken (fail). attempt 2: a redirects again (n=2
        // no longer < 2, so a succeeds directly).
        assert!(ok);
        assert_eq!(detail, "ok");
    }
}
