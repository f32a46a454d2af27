//! Driver running delivery and feedback across every credential scope.

use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::{Connector, Environment, TlsConnector};
use crate::delivery::{DeliveryEngine, DeliveryPolicy, DeliveryReport, Scope};
use crate::feedback::{FeedbackProcessor, FeedbackReport};
use crate::settings::PushSettings;
use crate::store::{AppId, DataStore, GroupNotification};
use crate::{Credential, PushError, Result};

/// Result of one scope within a run.
#[derive(Debug)]
pub struct ScopeOutcome<T> {
    /// Credential scope that ran.
    pub scope: Scope,
    /// Its report, or the error that stopped it.
    pub result: Result<T>,
}

/// Per-scope results of a run, apps first, then the global credential.
#[derive(Debug)]
pub struct RunReport<T> {
    /// Outcomes in the order the scopes ran.
    pub outcomes: Vec<ScopeOutcome<T>>,
}

impl<T> RunReport<T> {
    fn new() -> Self {
        Self {
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, scope: Scope, result: Result<T>) {
        if let Err(e) = &result {
            warn!(%scope, error = %e, "Scope failed");
        }
        self.outcomes.push(ScopeOutcome { scope, result });
    }

    /// Result for `scope`, if it ran.
    pub fn outcome(&self, scope: Scope) -> Option<&Result<T>> {
        self.outcomes.iter().find(|o| o.scope == scope).map(|o| &o.result)
    }

    /// Whether every scope succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Failed scopes with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (Scope, &PushError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.scope, e)))
    }

    /// Successful scope results.
    pub fn successes(&self) -> impl Iterator<Item = (Scope, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|r| (o.scope, r)))
    }
}

impl RunReport<DeliveryReport> {
    /// Notifications marked sent across all scopes.
    pub fn total_sent(&self) -> usize {
        self.successes().map(|(_, r)| r.sent).sum()
    }
}

impl RunReport<FeedbackReport> {
    /// Devices deleted across all scopes.
    pub fn total_removed(&self) -> usize {
        self.successes().map(|(_, r)| r.removed).sum()
    }
}

/// Runs each application with its own credential, then the global one.
///
/// A failing scope is recorded and the run moves on to the next scope.
pub struct PushRunner<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    environment: Environment,
    global_credential: Option<Credential>,
    delivery: DeliveryEngine<S, C>,
    feedback: FeedbackProcessor<S, C>,
}

impl<S> PushRunner<S, TlsConnector>
where
    S: DataStore + ?Sized,
{
    /// Runner talking to Apple over TLS as configured.
    pub fn from_settings(store: Arc<S>, settings: &PushSettings) -> Result<Self> {
        let connector = Arc::new(settings.connector()?);
        let mut runner = Self::new(store, connector, settings.environment).with_policy(settings.policy());
        if let Some(credential) = settings.global_credential()? {
            runner = runner.with_global_credential(credential);
        }
        Ok(runner)
    }
}

impl<S, C> PushRunner<S, C>
where
    S: DataStore + ?Sized,
    C: Connector + ?Sized,
{
    /// Runner over `store`, opening sessions through `connector`.
    ///
    /// `environment` picks which per-app certificate is used.
    pub fn new(store: Arc<S>, connector: Arc<C>, environment: Environment) -> Self {
        Self {
            delivery: DeliveryEngine::new(store.clone(), connector.clone()),
            feedback: FeedbackProcessor::new(store.clone(), connector),
            store,
            environment,
            global_credential: None,
        }
    }

    /// Also serve devices without an app using `credential`.
    pub fn with_global_credential(mut self, credential: Credential) -> Self {
        self.global_credential = Some(credential);
        self
    }

    /// Replace the oversize handling used for delivery.
    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery = self.delivery.with_policy(policy);
        self
    }

    /// Apple environment this runner selects certificates for.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Deliver pending per-device notifications for every scope.
    pub async fn send_notifications(&self) -> Result<RunReport<DeliveryReport>> {
        let mut report = RunReport::new();

        for app in self.store.list_applications().await? {
            let scope = Scope::App(app.id);
            let result = self.delivery.deliver(app.credential(self.environment), scope).await;
            report.push(scope, result);
        }

        if let Some(credential) = &self.global_credential {
            let result = self.delivery.deliver(Some(credential), Scope::Global).await;
            report.push(Scope::Global, result);
        }

        info!(
            scopes = report.outcomes.len(),
            sent = report.total_sent(),
            "Notification run finished"
        );
        Ok(report)
    }

    /// Deliver pending group notifications for every app.
    pub async fn send_group_notifications(&self) -> Result<RunReport<DeliveryReport>> {
        let mut report = RunReport::new();

        for app in self.store.list_applications().await? {
            let result = self
                .delivery
                .deliver_group_notifications(app.credential(self.environment), app.id)
                .await;
            report.push(Scope::App(app.id), result);
        }

        info!(
            scopes = report.outcomes.len(),
            sent = report.total_sent(),
            "Group notification run finished"
        );
        Ok(report)
    }

    /// Deliver one group notification of `app_id`.
    pub async fn send_group_notification(
        &self,
        app_id: AppId,
        notification: &GroupNotification,
    ) -> Result<DeliveryReport> {
        let app = self
            .store
            .list_applications()
            .await?
            .into_iter()
            .find(|a| a.id == app_id)
            .ok_or_else(|| PushError::Store(format!("unknown app {}", app_id)))?;

        self.delivery
            .deliver_group_notification(app.credential(self.environment), app_id, notification)
            .await
    }

    /// Read feedback for every scope and delete devices that went stale.
    pub async fn process_devices(&self) -> Result<RunReport<FeedbackReport>> {
        let mut report = RunReport::new();

        for app in self.store.list_applications().await? {
            let scope = Scope::App(app.id);
            let result = self.feedback.process(app.credential(self.environment), scope).await;
            report.push(scope, result);
        }

        if let Some(credential) = &self.global_credential {
            let result = self.feedback.process(Some(credential), Scope::Global).await;
            report.push(Scope::Global, result);
        }

        info!(
            scopes = report.outcomes.len(),
            removed = report.total_removed(),
            "Feedback run finished"
        );
        Ok(report)
    }
}
