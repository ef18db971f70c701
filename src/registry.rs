//! The schema registry: a static catalogue mapping event keys to subscription
//! descriptors, and endpoint names to endpoint descriptors.
//!
//! This is data, not logic — condition/body/response validation is
//! delegated to a [`Schema`] trait object so applications can plug in a
//! deeper validator (e.g. a real JSON Schema engine) without touching the
//! delivery cores. The catalogue shipped here covers enough subscription
//! types and endpoints to exercise the WebSocket and webhook cores
//! end-to-end; applications are free to register more via
//! [`Registry::insert_subscription`] / [`Registry::insert_endpoint`].

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::error::ValidationError;
use crate::scope::ScopeSet;

/// Validates a raw JSON value, returning the (possibly normalised) value or
/// a [`ValidationError`].
pub trait Schema: Send + Sync + fmt::Debug {
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError>;
}

/// Accepts any JSON value unchanged. Used for endpoints/events this crate's
/// built-in catalogue does not need to constrain further.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnySchema;

impl Schema for AnySchema {
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
        Ok(raw.clone())
    }
}

/// Requires `raw` to be a JSON object containing every named field.
#[derive(Debug, Clone)]
pub struct RequiredFieldsSchema {
    pub fields: Vec<&'static str>,
}

impl RequiredFieldsSchema {
    pub fn new(fields: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }
}

impl Schema for RequiredFieldsSchema {
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
        let obj = raw.as_object().ok_or_else(|| ValidationError::WrongType {
            field: "$".to_string(),
            reason: "expected a JSON object".to_string(),
        })?;
        for field in &self.fields {
            if !obj.contains_key(*field) {
                return Err(ValidationError::MissingField((*field).to_string()));
            }
        }
        Ok(raw.clone())
    }
}

/// HTTP method used by an [`EndpointDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

/// Auth requirement for an endpoint.
#[derive(Debug, Default, Clone)]
pub struct AuthRequirement {
    pub user_access_token: bool,
    pub app_access_token: bool,
    pub user_scopes: Option<ScopeSet>,
}

/// `{ method, path, requestQuery?, requestBody?, responseBody?,
/// successCodes[], errorCodes[], auth }`.
#[derive(Debug)]
pub struct EndpointDescriptor {
    pub name: &'static str,
    pub method: Method,
    pub path: &'static str,
    pub request_query: Option<Box<dyn Schema>>,
    pub request_body: Option<Box<dyn Schema>>,
    pub response_body: Option<Box<dyn Schema>>,
    pub success_codes: &'static [u16],
    pub error_codes: &'static [u16],
    pub auth: AuthRequirement,
}

/// `{ type, version, condition schema, event payload schema }`, keyed by
/// event key (e.g. `ChannelFollow`).
#[derive(Debug)]
pub struct SubscriptionDescriptor {
    pub key: &'static str,
    pub event_type: &'static str,
    pub version: &'static str,
    pub condition_schema: Box<dyn Schema>,
    pub event_schema: Box<dyn Schema>,
}

/// The catalogue. Cheap to construct; typically built once and shared behind
/// an `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    subscriptions: HashMap<&'static str, SubscriptionDescriptor>,
    by_type_version: HashMap<(String, String), &'static str>,
    endpoints: HashMap<&'static str, EndpointDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&mut self, descriptor: SubscriptionDescriptor) {
        let key = (
            descriptor.event_type.to_string(),
            descriptor.version.to_string(),
        );
        self.by_type_version.insert(key, descriptor.key);
        self.subscriptions.insert(descriptor.key, descriptor);
    }

    pub fn insert_endpoint(&mut self, descriptor: EndpointDescriptor) {
        self.endpoints.insert(descriptor.name, descriptor);
    }

    pub fn lookup_by_key(&self, key: &str) -> Option<&SubscriptionDescriptor> {
        self.subscriptions.get(key)
    }

    pub fn lookup_by_type_and_version(&self, typ: &str, version: &str) -> Option<&SubscriptionDescriptor> {
        let key = self
            .by_type_version
            .get(&(typ.to_string(), version.to_string()))?;
        self.subscriptions.get(key)
    }

    pub fn all_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.subscriptions.keys().copied()
    }

    pub fn lookup_endpoint(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.get(name)
    }

    pub fn all_endpoints(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.endpoints.keys().copied()
    }

    /// The built-in catalogue: a handful of representative subscription
    /// types plus the EventSub management endpoints.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();

        reg.insert_subscription(SubscriptionDescriptor {
            key: "ChannelFollow",
            event_type: "channel.follow",
            version: "2",
            condition_schema: Box::new(RequiredFieldsSchema::new([
                "broadcaster_user_id",
                "moderator_user_id",
            ])),
            event_schema: Box::new(AnySchema),
        });

        reg.insert_subscription(SubscriptionDescriptor {
            key: "ChannelUpdate",
            event_type: "channel.update",
            version: "2",
            condition_schema: Box::new(RequiredFieldsSchema::new(["broadcaster_user_id"])),
            event_schema: Box::new(AnySchema),
        });

        reg.insert_subscription(SubscriptionDescriptor {
            key: "StreamOnline",
            event_type: "stream.online",
            version: "1",
            condition_schema: Box::new(RequiredFieldsSchema::new(["broadcaster_user_id"])),
            event_schema: Box::new(AnySchema),
        });

        reg.insert_subscription(SubscriptionDescriptor {
            key: "StreamOffline",
            event_type: "stream.offline",
            version: "1",
            condition_schema: Box::new(RequiredFieldsSchema::new(["broadcaster_user_id"])),
            event_schema: Box::new(AnySchema),
        });

        reg.insert_subscription(SubscriptionDescriptor {
            key: "ChannelPointsCustomRewardRedemptionAdd",
            event_type: "channel.channel_points_custom_reward_redemption.add",
            version: "1",
            condition_schema: Box::new(RequiredFieldsSchema::new(["broadcaster_user_id"])),
            event_schema: Box::new(AnySchema),
        });

        reg.insert_subscription(SubscriptionDescriptor {
            key: "ChannelChatMessage",
            event_type: "channel.chat.message",
            version: "1",
            condition_schema: Box::new(RequiredFieldsSchema::new([
                "broadcaster_user_id",
                "user_id",
            ])),
            event_schema: Box::new(AnySchema),
        });

        reg.insert_endpoint(EndpointDescriptor {
            name: "createEventSubSubscription",
            method: Method::Post,
            path: "eventsub/subscriptions",
            request_query: None,
            request_body: Some(Box::new(RequiredFieldsSchema::new([
                "type",
                "version",
                "condition",
                "transport",
            ]))),
            response_body: Some(Box::new(RequiredFieldsSchema::new(["data"]))),
            success_codes: &[202],
            error_codes: &[400, 401, 403, 409, 429],
            auth: AuthRequirement {
                user_access_token: true,
                app_access_token: true,
                user_scopes: None,
            },
        });

        reg.insert_endpoint(EndpointDescriptor {
            name: "deleteEventSubSubscription",
            method: Method::Delete,
            path: "eventsub/subscriptions",
            request_query: Some(Box::new(RequiredFieldsSchema::new(["id"]))),
            request_body: None,
            response_body: None,
            success_codes: &[204],
            error_codes: &[400, 401, 404],
            auth: AuthRequirement {
                user_access_token: true,
                app_access_token: true,
                user_scopes: None,
            },
        });

        reg.insert_endpoint(EndpointDescriptor {
            name: "getEventSubSubscriptions",
            method: Method::Get,
            path: "eventsub/subscriptions",
            request_query: Some(Box::new(AnySchema)),
            request_body: None,
            response_body: Some(Box::new(RequiredFieldsSchema::new(["data"]))),
            success_codes: &[200],
            error_codes: &[400, 401],
            auth: AuthRequirement {
                user_access_token: true,
                app_access_token: true,
                user_scopes: None,
            },
        });

        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_resolves_channel_follow() {
        let reg = Registry::with_defaults();
        let desc = reg.lookup_by_key("ChannelFollow").unwrap();
        assert_eq!(desc.event_type, "channel.follow");
        assert_eq!(desc.version, "2");

        let by_type = reg
            .lookup_by_type_and_version("channel.follow", "2")
            .unwrap();
        assert_eq!(by_type.key, "ChannelFollow");
    }

    #[test]
    fn required_fields_schema_rejects_missing_field() {
        let schema = RequiredFieldsSchema::new(["broadcaster_user_id"]);
        let err = schema.parse(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField(f) if f == "broadcaster_user_id"));
    }

    #[test]
    fn endpoints_are_registered() {
        let reg = Registry::with_defaults();
        assert!(reg.lookup_endpoint("createEventSubSubscription").is_some());
        assert!(reg.lookup_endpoint("deleteEventSubSubscription").is_some());
    }
}
