//! Host service registry with async handlers
//!
//! Services are the host's command surface: `light.turn_on`,
//! `persistent_notification.create`, and the bridge's own
//! `aiembodied.invoke_service` all live here. Registration is keyed by
//! `domain.service`; registering an existing key replaces the handler.

use dashmap::DashMap;
use embodied_core::{Context, ServiceCall, SupportsResponse};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub type ServiceResult = Result<Option<Value>, ServiceError>;

pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service not found: {0}")]
    NotFound(ServiceKey),

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("service does not support responses")]
    ResponseNotSupported,
}

/// `domain.service` pair identifying one service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub domain: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.service)
    }
}

/// What a caller can learn about a registered service
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub key: ServiceKey,
    pub schema: Option<Value>,
    pub supports_response: SupportsResponse,
}

struct Registration {
    handler: ServiceHandler,
    description: ServiceDescription,
    validator: Option<Arc<JSONSchema>>,
}

impl Registration {
    fn validate(&self, data: &Value) -> Result<(), ServiceError> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        validator.validate(data).map_err(|errors| {
            let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            ServiceError::InvalidData(message)
        })
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<ServiceKey, Registration>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service handler.
    ///
    /// A schema that fails to compile is logged and ignored; the service is
    /// still registered without validation.
    #[instrument(skip(self, domain, service, handler, schema))]
    pub fn register<F, Fut>(
        &self,
        domain: impl Into<String>,
        service: impl Into<String>,
        handler: F,
        schema: Option<Value>,
        supports_response: SupportsResponse,
    ) where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let key = ServiceKey::new(domain, service);
        debug!(service = %key, "Registering service");

        let validator = schema.as_ref().and_then(|schema| match JSONSchema::compile(schema) {
            Ok(compiled) => Some(Arc::new(compiled)),
            Err(err) => {
                warn!(service = %key, error = %err, "Ignoring invalid service schema");
                None
            }
        });

        let registration = Registration {
            handler: Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture),
            description: ServiceDescription {
                key: key.clone(),
                schema,
                supports_response,
            },
            validator,
        };
        self.services.insert(key, registration);
    }

    /// Call a service.
    ///
    /// With `return_response` the handler's value is passed back; without it
    /// the value is dropped. Asking a service without response support for
    /// one is an error.
    #[instrument(skip(self, service_data, context))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
        context: Context,
        return_response: bool,
    ) -> ServiceResult {
        let key = ServiceKey::new(domain, service);
        let handler = self.prepare(&key, &service_data, return_response)?;

        debug!(service = %key, "Calling service");
        let response = handler(ServiceCall::new(domain, service, service_data, context)).await?;
        Ok(response.filter(|_| return_response))
    }

    /// Checks done before a handler runs; the map guard ends here
    fn prepare(
        &self,
        key: &ServiceKey,
        data: &Value,
        return_response: bool,
    ) -> Result<ServiceHandler, ServiceError> {
        let registration = self.services.get(key).ok_or_else(|| {
            warn!(service = %key, "Service not found");
            ServiceError::NotFound(key.clone())
        })?;

        if return_response && registration.description.supports_response == SupportsResponse::None {
            return Err(ServiceError::ResponseNotSupported);
        }
        registration.validate(data)?;
        Ok(registration.handler.clone())
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&ServiceKey::new(domain, service))
    }

    pub fn get_service(&self, domain: &str, service: &str) -> Option<ServiceDescription> {
        self.services
            .get(&ServiceKey::new(domain, service))
            .map(|r| r.description.clone())
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        let removed = self
            .services
            .remove(&ServiceKey::new(domain, service))
            .is_some();
        if removed {
            debug!("Unregistered service");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
