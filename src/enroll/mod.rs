//! Certificate enrollment.
//!
//! One state machine shared by every backend that can obtain a certificate
//! from a CA:
//!
//! ```text
//! complete? ──yes──▶ AlreadyEnrolled (no network)
//!    │ no
//!    ▼
//! DirectoryPrep → KeyEnsure → CaEnsure → CsrEnsure → CsrSubmit → CertPoll
//!                                                                 │
//!                      certificate ◀── fetch ◀── tick ◀───────────┤
//!                      deadline    ──▶ EnrollmentTimedOut         │
//!                      cancel      ──▶ EnrollmentInterrupted ◀────┘
//! ```
//!
//! The CA protocol is behind [`CertificateAuthority`] and the retry cadence
//! behind [`PollStrategy`], so the machine itself knows neither Puppet nor
//! Kubernetes.

pub mod artifacts;
pub mod cert_manager_api;
pub mod discovery;
pub mod puppet_ca;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::enroll::artifacts::{ArtifactLayout, CsrSubject};
use crate::{Error, Result};

/// Progress callback: CSR digest and 1-based attempt number.
pub type ProgressFn<'a> = dyn Fn(&str, u32) + Send + Sync + 'a;

/// Result of a successful enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// Key, CA and certificate were already present; nothing was done.
    AlreadyEnrolled,
    /// A certificate was obtained after `attempts` fetches.
    Enrolled {
        /// Number of certificate fetch attempts made
        attempts: u32,
    },
}

/// Signed material returned by a CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMaterial {
    /// PEM certificate.
    pub certificate: String,
    /// PEM CA bundle, when the CA returns it alongside the certificate.
    pub ca: Option<String>,
}

/// The CA side of enrollment.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Fetch the CA bundle before any trust exists.
    ///
    /// `Ok(None)` means the bundle arrives with the signed certificate.
    async fn fetch_ca(&self) -> Result<Option<String>>;

    /// Submit a CSR. `preexisting` is set when the CSR came from an earlier run.
    async fn submit_csr(&self, csr_pem: &str, preexisting: bool) -> Result<()>;

    /// Fetch the signed certificate; `Ok(None)` while it is not ready.
    async fn fetch_certificate(&self) -> Result<Option<SignedMaterial>>;

    /// Whether a failed submission of a preexisting CSR may be ignored
    /// because the earlier submission may already have been accepted.
    fn tolerate_resubmit_failure(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Poll strategy
// ─────────────────────────────────────────────────────────────────────────────

/// Delay between certificate fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollStrategy {
    /// The same delay every time.
    Fixed {
        /// Delay between attempts
        #[serde(with = "crate::config::humantime_serde")]
        interval: Duration,
    },
    /// Delays growing by `factor` from `initial` up to `max`.
    Exponential {
        /// First delay
        #[serde(with = "crate::config::humantime_serde")]
        initial: Duration,
        /// Upper bound on any delay
        #[serde(with = "crate::config::humantime_serde")]
        max: Duration,
        /// Growth factor
        factor: f32,
    },
}

impl PollStrategy {
    /// Endless sequence of delays.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match *self {
            Self::Fixed { interval } => Box::new(
                ConstantBuilder::default()
                    .with_delay(interval)
                    .with_max_times(usize::MAX)
                    .build(),
            ),
            Self::Exponential {
                initial,
                max,
                factor,
            } => {
                let backoff = ExponentialBuilder::default()
                    .with_min_delay(initial)
                    .with_max_delay(max)
                    .with_factor(factor)
                    .with_max_times(usize::MAX)
                    .build();
                Box::new(backoff.chain(std::iter::repeat(max)))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

/// One identity's enrollment plan.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Where artifacts live.
    pub layout: ArtifactLayout,
    /// CSR subject.
    pub subject: CsrSubject,
    /// Retry cadence of the poll loop.
    pub strategy: PollStrategy,
}

impl Enrollment {
    /// Drive enrollment against `ca` until a certificate is stored, `max_wait`
    /// elapses or `cancel` fires.
    ///
    /// # Errors
    ///
    /// [`Error::EnrollmentTimedOut`], [`Error::EnrollmentInterrupted`], any
    /// artifact IO failure, or a CA failure outside the poll loop.
    pub async fn run(
        &self,
        ca: &dyn CertificateAuthority,
        cancel: &CancellationToken,
        max_wait: Duration,
        progress: &ProgressFn<'_>,
    ) -> Result<EnrollOutcome> {
        self.run_until(ca, cancel, Instant::now() + max_wait, progress)
            .await
    }

    /// Same as [`Enrollment::run`] against an absolute deadline, for callers
    /// that spend part of the wait on discovery first.
    ///
    /// # Errors
    ///
    /// See [`Enrollment::run`].
    pub async fn run_until(
        &self,
        ca: &dyn CertificateAuthority,
        cancel: &CancellationToken,
        deadline: Instant,
        progress: &ProgressFn<'_>,
    ) -> Result<EnrollOutcome> {
        let identity = self.subject.common_name.as_str();

        if self.layout.complete() {
            info!(identity, "already enrolled, nothing to do");
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        if cancel.is_cancelled() {
            return Err(Error::EnrollmentInterrupted { attempts: 0 });
        }

        self.layout.prepare_directories()?;
        let key = self.layout.ensure_key()?;

        if !self.layout.ca.is_file() {
            if let Some(bundle) = interruptible(cancel, deadline, ca.fetch_ca()).await? {
                self.layout.write_ca(&bundle)?;
                info!(identity, path = %self.layout.ca.display(), "stored CA bundle");
            }
        }

        let csr = self.layout.ensure_csr(&key, &self.subject)?;

        if !self.layout.certificate.is_file() {
            let submitted =
                interruptible(cancel, deadline, ca.submit_csr(&csr.pem, csr.preexisting)).await;
            match submitted {
                Ok(()) => info!(identity, digest = %csr.digest, "submitted certificate request"),
                Err(e @ (Error::EnrollmentInterrupted { .. } | Error::EnrollmentTimedOut { .. })) => {
                    return Err(e);
                }
                Err(e) if csr.preexisting && ca.tolerate_resubmit_failure() => {
                    warn!(identity, error = %e, "resubmitting earlier request failed, polling anyway");
                }
                Err(e) => return Err(e),
            }
        }

        let material = self
            .poll(ca, cancel, deadline, &csr.digest, progress)
            .await?;

        if let Some(bundle) = &material.signed.ca {
            self.layout.write_ca(bundle)?;
        }
        self.layout.write_certificate(&material.signed.certificate)?;

        info!(
            identity,
            attempts = material.attempts,
            path = %self.layout.certificate.display(),
            "enrollment complete"
        );

        Ok(EnrollOutcome::Enrolled {
            attempts: material.attempts,
        })
    }

    async fn poll(
        &self,
        ca: &dyn CertificateAuthority,
        cancel: &CancellationToken,
        deadline: Instant,
        digest: &str,
        progress: &ProgressFn<'_>,
    ) -> Result<Polled> {
        let mut delays = self.strategy.delays();
        let mut attempts = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::EnrollmentInterrupted { attempts });
            }

            attempts += 1;
            progress(digest, attempts);

            match ca.fetch_certificate().await {
                Ok(Some(signed)) => return Ok(Polled { signed, attempts }),
                Ok(None) => debug!(attempt = attempts, "certificate not signed yet"),
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "certificate fetch failed");
                    last_error = Some(e.to_string());
                }
            }

            let delay = delays.next().unwrap_or(Duration::from_secs(10));

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(Error::EnrollmentInterrupted { attempts });
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Error::EnrollmentTimedOut { attempts, last_error });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// `url` with a trailing `/`, so relative joins extend its path instead of
/// replacing the last segment.
pub(crate) fn as_directory(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Await one CA step unless `cancel` fires or `deadline` passes first.
///
/// # Errors
///
/// [`Error::EnrollmentInterrupted`] or [`Error::EnrollmentTimedOut`] with no
/// fetch attempts, or whatever `step` returns.
pub async fn interruptible<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::EnrollmentInterrupted { attempts: 0 }),
        () = tokio::time::sleep_until(deadline) => Err(Error::EnrollmentTimedOut {
            attempts: 0,
            last_error: None,
        }),
        r = step => r,
    }
}

struct Polled {
    signed: SignedMaterial,
    attempts: u32,
}
