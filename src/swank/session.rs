use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeSettings;
use crate::error::{BridgeError, BridgeResult, ErrorReport};
use crate::evaluator::{DebuggerSession, DebuggerStack, EvaluatorLink, RecoveryAction};

/// State shared by every handler: the evaluator link, the debugger stack and
/// the shutdown signal for the editor server.
pub struct Session {
    settings: BridgeSettings,
    link: Option<EvaluatorLink>,
    debugger: DebuggerStack,
    shutdown: CancellationToken,
}

impl Session {
    /// A session with no evaluator yet; see [`launch`](Self::launch).
    pub fn new(settings: BridgeSettings, shutdown: CancellationToken) -> Self {
        Self {
            settings,
            link: None,
            debugger: DebuggerStack::new(),
            shutdown,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn debugger(&self) -> &DebuggerStack {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut DebuggerStack {
        &mut self.debugger
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// The live evaluator link.
    pub fn link(&mut self) -> Result<&mut EvaluatorLink, ErrorReport> {
        self.link
            .as_mut()
            .ok_or_else(|| ErrorReport::fatal("No evaluator is running; invoke RESTART to start one"))
    }

    /// Start an evaluator, replacing (and terminating) any current one.
    pub async fn launch(&mut self) -> Result<(), ErrorReport> {
        if let Some(old) = self.link.take() {
            old.shutdown().await;
        }
        let link = EvaluatorLink::launch(&self.settings).await?;
        self.link = Some(link);
        Ok(())
    }

    /// Drop every debugger level and start a fresh evaluator.
    pub async fn restart(&mut self) -> Result<(), ErrorReport> {
        info!(target: "swankbridge::swank", "Restarting evaluator");
        self.debugger.clear();
        self.launch().await
    }

    /// Close the debugger session at `level` and apply `action`.
    ///
    /// The closed session is returned even when the action itself failed;
    /// that failure is the second element.
    pub async fn apply_recovery(
        &mut self,
        level: usize,
        action: RecoveryAction,
    ) -> BridgeResult<(DebuggerSession, Result<(), ErrorReport>)> {
        let closed = self.debugger.take(level).ok_or_else(|| {
            BridgeError::invalid_arguments(
                "swank:invoke-nth-restart-for-emacs",
                format!("no debugger session at level {}", level),
            )
        })?;
        info!(
            target: "swankbridge::swank",
            "Debugger level {}: {}",
            level,
            action.name()
        );

        let outcome = match action {
            RecoveryAction::Quit => {
                self.debugger.clear();
                match self.link.as_mut() {
                    Some(link) if !link.is_failed() => link.reset_to_top_level().await,
                    _ => Ok(()),
                }
            }
            RecoveryAction::Continue => {
                if let Some(link) = self.link.as_mut() {
                    link.acknowledge_recovery();
                }
                Ok(())
            }
            RecoveryAction::Restart => self.restart().await,
        };
        if let Err(report) = &outcome {
            warn!(
                target: "swankbridge::swank",
                "{} failed: {}",
                action.name(),
                report.message
            );
        }
        Ok((closed, outcome))
    }

    /// Ask the editor server to stop after the current request.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Terminate the evaluator, if any.
    pub async fn shutdown(&mut self) {
        self.debugger.clear();
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
    }
}
