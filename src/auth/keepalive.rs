//! Session keepalive and refresh.
//!
//! Every trading call goes through [`SessionController::ensure_ready`]. When
//! the session is fresh this is a lock read; otherwise the caller joins the
//! single in-flight refresh (heartbeat or full bootstrap).

use super::{AuthPipeline, Freshness, SingleFlight};
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Coalesces concurrent readiness checks into one refresh.
pub struct SessionController {
    pipeline: Arc<AuthPipeline>,
    flight: SingleFlight<Result<()>>,
}

impl SessionController {
    pub fn new(pipeline: Arc<AuthPipeline>) -> Self {
        Self {
            pipeline,
            flight: SingleFlight::new(),
        }
    }

    /// Make sure the session can serve trading calls.
    pub async fn ensure_ready(&self) -> Result<()> {
        // A joined logout flight succeeds without leaving a usable session
        for _ in 0..2 {
            if self.pipeline.freshness().await == Freshness::Fresh {
                return Ok(());
            }
            let pipeline = self.pipeline.clone();
            self.flight
                .run(move || async move { keep_alive(pipeline).await })
                .await?;
        }
        Ok(())
    }

    /// End the session once any refresh in flight has finished, so a
    /// bootstrap never completes on top of a wiped session.
    pub async fn logout(&self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        self.flight
            .run_after(move || async move { pipeline.logout().await })
            .await
    }

    /// Wipe the session and bootstrap from scratch. Callers that arrive while
    /// any refresh is in flight share its outcome.
    pub async fn force_refresh(&self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        self.flight
            .run(move || async move {
                pipeline.reset().await;
                pipeline.bootstrap(true).await
            })
            .await
    }

    pub fn pipeline(&self) -> &Arc<AuthPipeline> {
        &self.pipeline
    }

    /// Number of refresh flights started.
    pub fn refreshes_started(&self) -> u64 {
        self.flight.flights_started()
    }
}

async fn keep_alive(pipeline: Arc<AuthPipeline>) -> Result<()> {
    match pipeline.freshness().await {
        Freshness::Fresh => Ok(()),
        Freshness::HeartbeatDue => match pipeline.heartbeat().await {
            Ok(true) => {
                debug!("Heartbeat ok");
                Ok(())
            }
            Ok(false) => {
                warn!("Heartbeat reports the brokerage session unauthenticated, rebootstrapping");
                pipeline.mark_not_ready().await;
                pipeline.bootstrap(false).await
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat failed, rebootstrapping");
                pipeline.mark_not_ready().await;
                pipeline.bootstrap(false).await
            }
        },
        Freshness::Stale => pipeline.bootstrap(false).await,
    }
}
