//! Action invocation gate
//!
//! Inbound requests from the upstream side to run a host action pass through
//! the gate: validated, refused while paused, executed, audited and reported
//! back upstream as an `action_result`.

use embodied_client::UpstreamClient;
use embodied_core::{Context, ServiceCall};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::autonomy::AutonomyController;
use crate::constants::{EVENT_ACTION_EXECUTED, SOURCE_ACTION_RESULT};
use crate::error::GateError;
use crate::host::{AuditSink, CommandExecutor};

/// A request to execute one host action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub entry_id: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub service_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl ActionRequest {
    pub fn new(
        entry_id: impl Into<String>,
        domain: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            domain: domain.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    /// Decode raw service data. Type mismatches are configuration errors.
    pub fn from_value(value: Value) -> Result<Self, GateError> {
        serde_json::from_value(value).map_err(|err| GateError::Configuration(err.to_string()))
    }

    pub fn with_service_data(mut self, data: Map<String, Value>) -> Self {
        self.service_data = data;
        self
    }

    pub fn with_target(mut self, target: Map<String, Value>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adopt a context's fields where the request carries none
    pub fn with_default_context(mut self, context: &Context) -> Self {
        if self.context_id.is_none() && self.user_id.is_none() && self.parent_id.is_none() {
            self.context_id = Some(context.id.clone());
            self.user_id = context.user_id.clone();
            self.parent_id = context.parent_id.clone();
        }
        self
    }

    fn validate(&self) -> Result<(), GateError> {
        for (field, value) in [
            ("entry_id", &self.entry_id),
            ("domain", &self.domain),
            ("service", &self.service),
        ] {
            if value.trim().is_empty() {
                return Err(GateError::Configuration(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Context the action executes under
    fn execution_context(&self) -> Context {
        let mut context = match &self.context_id {
            Some(id) if !id.is_empty() => Context::with_id(id.clone()),
            _ => Context::new(),
        };
        context.user_id = self.user_id.clone().filter(|id| !id.is_empty());
        context.parent_id = self.parent_id.clone().filter(|id| !id.is_empty());
        context
    }

    /// Context fields echoed upstream; only those supplied and non-empty
    fn reported_context(&self) -> Option<Value> {
        let mut map = Map::new();
        for (key, value) in [
            ("id", &self.context_id),
            ("user_id", &self.user_id),
            ("parent_id", &self.parent_id),
        ] {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                map.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        (!map.is_empty()).then_some(Value::Object(map))
    }
}

/// Outcome returned to the caller of [`ActionInvocationGate::invoke`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

pub struct ActionInvocationGate {
    autonomy: Arc<AutonomyController>,
    executor: Arc<dyn CommandExecutor>,
    client: Arc<dyn UpstreamClient>,
    audit: Arc<dyn AuditSink>,
}

impl ActionInvocationGate {
    pub fn new(
        autonomy: Arc<AutonomyController>,
        executor: Arc<dyn CommandExecutor>,
        client: Arc<dyn UpstreamClient>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            autonomy,
            executor,
            client,
            audit,
        }
    }

    /// Execute one action request.
    ///
    /// Invalid requests and requests made while paused are rejected before
    /// anything runs. Executor failures come back as `success: false`; a
    /// failed upstream report only affects the autonomy diagnostics.
    #[instrument(skip(self, request), fields(domain = %request.domain, service = %request.service))]
    pub async fn invoke(&self, request: ActionRequest) -> Result<ActionResponse, GateError> {
        request.validate()?;

        if self.autonomy.paused() {
            debug!("Rejecting action while autonomy is paused");
            return Err(GateError::Paused);
        }

        let service_data =
            ServiceCall::merge_target(Value::Object(request.service_data.clone()), request.target.as_ref());

        let (success, result, error) = match self
            .executor
            .execute(
                &request.domain,
                &request.service,
                service_data,
                request.execution_context(),
            )
            .await
        {
            Ok(result) => (true, result, None),
            Err(err) => {
                warn!(error = %err, "Action execution failed");
                (false, None, Some(err.to_string()))
            }
        };

        self.fire_audit(&request, success, error.as_deref());
        self.report(&request, success, result.as_ref(), error.as_deref())
            .await;

        Ok(ActionResponse {
            success,
            result,
            error,
            correlation_id: request.correlation_id,
        })
    }

    fn fire_audit(&self, request: &ActionRequest, success: bool, error: Option<&str>) {
        let mut data = Map::new();
        data.insert("entry_id".into(), json!(request.entry_id));
        data.insert("domain".into(), json!(request.domain));
        data.insert("service".into(), json!(request.service));
        if let Some(correlation_id) = &request.correlation_id {
            data.insert("correlation_id".into(), json!(correlation_id));
        }
        data.insert("success".into(), json!(success));
        if let Some(error) = error {
            data.insert("error".into(), json!(error));
        }
        self.audit.audit(EVENT_ACTION_EXECUTED, Value::Object(data));
    }

    async fn report(
        &self,
        request: &ActionRequest,
        success: bool,
        result: Option<&Value>,
        error: Option<&str>,
    ) {
        let mut action = Map::new();
        action.insert("entry_id".into(), json!(request.entry_id));
        action.insert("domain".into(), json!(request.domain));
        action.insert("service".into(), json!(request.service));
        action.insert("service_data".into(), Value::Object(request.service_data.clone()));
        if let Some(target) = &request.target {
            action.insert("target".into(), Value::Object(target.clone()));
        }
        if let Some(correlation_id) = &request.correlation_id {
            action.insert("correlation_id".into(), json!(correlation_id));
        }
        action.insert("success".into(), json!(success));
        if let Some(result) = result {
            action.insert("result".into(), result.clone());
        }
        if let Some(error) = error {
            action.insert("error".into(), json!(error));
        }
        if let Some(context) = request.reported_context() {
            action.insert("context".into(), context);
        }

        let payload = json!({"type": "action_result", "action": action});
        match self.client.post_json(&payload).await {
            Ok(_) => self.autonomy.record_success(),
            Err(err) => {
                warn!(error = %err, "Failed to report action result");
                self.autonomy
                    .record_failure(SOURCE_ACTION_RESULT, &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutionError, PersistError};
    use crate::host::{Notifier, OptionsStore};
    use async_trait::async_trait;
    use embodied_client::{ClientError, ClientResult};
    use std::sync::Mutex;

    struct NoopOptions;

    #[async_trait]
    impl OptionsStore for NoopOptions {
        fn stored_paused(&self, _entry_id: &str) -> Option<bool> {
            None
        }

        async fn store_paused(&self, _entry_id: &str, _paused: bool) -> Result<(), PersistError> {
            Ok(())
        }
    }

    struct NoopNotifier;

    impl Notifier for NoopNotifier {
        fn notify(&self, _title: &str, _message: &str, _notification_id: &str) {}
    }

    #[derive(Default)]
    struct StubExecutor {
        fail: bool,
        calls: Mutex<Vec<(String, String, Value, Context)>>,
    }

    #[async_trait]
    impl CommandExecutor for StubExecutor {
        async fn execute(
            &self,
            domain: &str,
            service: &str,
            service_data: Value,
            context: Context,
        ) -> Result<Option<Value>, ExecutionError> {
            self.calls.lock().unwrap().push((
                domain.to_string(),
                service.to_string(),
                service_data,
                context,
            ));
            if self.fail {
                Err(ExecutionError("Entity not found".to_string()))
            } else {
                Ok(Some(json!({"status": "ok"})))
            }
        }
    }

    #[derive(Default)]
    struct StubClient {
        fail: bool,
        payloads: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl UpstreamClient for StubClient {
        async fn post_json(&self, payload: &Value) -> ClientResult<Value> {
            self.payloads.lock().unwrap().push(payload.clone());
            if self.fail {
                Err(ClientError::communication("timeout"))
            } else {
                Ok(json!({}))
            }
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl AuditSink for RecordingAudit {
        fn audit(&self, event_type: &str, data: Value) {
            self.events.lock().unwrap().push((event_type.to_string(), data));
        }
    }

    struct Harness {
        autonomy: Arc<AutonomyController>,
        executor: Arc<StubExecutor>,
        client: Arc<StubClient>,
        audit: Arc<RecordingAudit>,
        gate: ActionInvocationGate,
    }

    fn harness(paused: bool, executor_fails: bool, client_fails: bool) -> Harness {
        let autonomy = Arc::new(AutonomyController::new(
            "entry1",
            paused,
            3,
            Arc::new(NoopOptions),
            Arc::new(NoopNotifier),
        ));
        let executor = Arc::new(StubExecutor {
            fail: executor_fails,
            ..Default::default()
        });
        let client = Arc::new(StubClient {
            fail: client_fails,
            ..Default::default()
        });
        let audit = Arc::new(RecordingAudit::default());
        let gate = ActionInvocationGate::new(
            autonomy.clone(),
            executor.clone(),
            client.clone(),
            audit.clone(),
        );
        Harness {
            autonomy,
            executor,
            client,
            audit,
            gate,
        }
    }

    fn turn_on() -> ActionRequest {
        let mut target = Map::new();
        target.insert("entity_id".into(), json!("light.kitchen"));
        let mut data = Map::new();
        data.insert("brightness".into(), json!(200));
        ActionRequest::new("entry1", "light", "turn_on")
            .with_service_data(data)
            .with_target(target)
            .with_correlation_id("corr-1")
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let h = harness(false, false, false);

        let response = h.gate.invoke(turn_on()).await.unwrap();
        assert_eq!(
            response,
            ActionResponse {
                success: true,
                result: Some(json!({"status": "ok"})),
                error: None,
                correlation_id: Some("corr-1".to_string()),
            }
        );

        let calls = h.executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, json!({"brightness": 200, "entity_id": "light.kitchen"}));

        let events = h.audit.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "aiembodied.action_executed");
        assert_eq!(
            events[0].1,
            json!({
                "entry_id": "entry1",
                "domain": "light",
                "service": "turn_on",
                "correlation_id": "corr-1",
                "success": true
            })
        );

        let payloads = h.client.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["type"], "action_result");
        let action = &payloads[0]["action"];
        assert_eq!(action["service_data"], json!({"brightness": 200}));
        assert_eq!(action["target"], json!({"entity_id": "light.kitchen"}));
        assert_eq!(action["result"], json!({"status": "ok"}));
        assert!(action.get("context").is_none());
    }

    #[tokio::test]
    async fn test_paused_gate_rejects_before_execution() {
        let h = harness(true, false, false);

        let result = h.gate.invoke(turn_on()).await;

        assert_eq!(result, Err(GateError::Paused));
        assert!(h.executor.calls.lock().unwrap().is_empty());
        assert!(h.audit.events.lock().unwrap().is_empty());
        assert!(h.client.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_are_configuration_errors() {
        let h = harness(false, false, false);

        for request in [
            ActionRequest::new("", "light", "turn_on"),
            ActionRequest::new("entry1", " ", "turn_on"),
            ActionRequest::new("entry1", "light", ""),
        ] {
            let result = h.gate.invoke(request).await;
            assert!(matches!(result, Err(GateError::Configuration(_))));
        }
        assert!(h.executor.calls.lock().unwrap().is_empty());

        let err = ActionRequest::from_value(json!({"entry_id": 5})).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_executor_failure_becomes_result() {
        let h = harness(false, true, false);

        let response = h.gate.invoke(turn_on()).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Entity not found"));
        assert!(response.result.is_none());

        let events = h.audit.events.lock().unwrap();
        assert_eq!(events[0].1["success"], false);
        assert_eq!(events[0].1["error"], "Entity not found");

        let payloads = h.client.payloads.lock().unwrap();
        assert_eq!(payloads[0]["action"]["error"], "Entity not found");
        assert!(payloads[0]["action"].get("result").is_none());
    }

    #[tokio::test]
    async fn test_report_failure_keeps_success() {
        let h = harness(false, false, true);

        let response = h.gate.invoke(turn_on()).await.unwrap();

        assert!(response.success);
        let diagnostics = h.autonomy.diagnostics();
        assert_eq!(diagnostics.consecutive_failures, 1);
        assert_eq!(diagnostics.last_source.as_deref(), Some("action_result"));
    }

    #[tokio::test]
    async fn test_context_fields_flow_through() {
        let h = harness(false, false, false);
        let mut request = turn_on();
        request.context_id = Some("ctx-9".to_string());
        request.user_id = Some("user-1".to_string());

        h.gate.invoke(request).await.unwrap();

        let calls = h.executor.calls.lock().unwrap();
        assert_eq!(calls[0].3.id, "ctx-9");
        assert_eq!(calls[0].3.user_id.as_deref(), Some("user-1"));

        let payloads = h.client.payloads.lock().unwrap();
        assert_eq!(
            payloads[0]["action"]["context"],
            json!({"id": "ctx-9", "user_id": "user-1"})
        );
    }

    #[test]
    fn test_request_from_service_data() {
        let request = ActionRequest::from_value(json!({
            "entry_id": "entry1",
            "domain": "light",
            "service": "turn_on",
            "target": {"entity_id": "light.kitchen"}
        }))
        .unwrap()
        .with_default_context(&Context::with_id("call-ctx").user("u"));

        assert!(request.service_data.is_empty());
        assert_eq!(request.context_id.as_deref(), Some("call-ctx"));
        assert_eq!(request.user_id.as_deref(), Some("u"));
    }
}
