//! Device verbs: describe/introspection, variable read, function call,
//! signal raising and the inbound event bridge.
//!
//! Every verb fails fast while another holder owns the flash lock, and
//! the verbs that need device state ensure introspection first.

use serde_json::Value;

use super::{DeviceSession, SendAuth, SendOutcome};
use crate::error::{CoreError, Result};
use crate::events::CloudEvent;
use crate::messages::{
    build_arguments, from_binary, translate_int_types, ArgSpec, DeviceValue, MessageName, Params,
    VariableType,
};

/// The device's self-description, split into system information and the
/// application function/variable state. Replaced atomically by a later
/// describe.
#[derive(Debug, Clone)]
pub struct Introspection {
    pub system_information: Value,
    pub function_state: Value,
}

impl DeviceSession {
    /// Fetch (or return cached) introspection data.
    pub async fn describe(&self) -> Result<Introspection> {
        self.ensure_unlocked().await?;
        self.ensure_introspection().await
    }

    /// Read a variable, decoding the payload with its declared type.
    pub async fn get_variable(&self, name: &str) -> Result<DeviceValue> {
        self.ensure_unlocked().await?;
        let introspection = self.ensure_introspection().await?;

        let variables = introspection
            .function_state
            .get("v")
            .and_then(Value::as_object)
            .ok_or(CoreError::NoDeviceState)?;
        let declared = variables.get(name).ok_or(CoreError::UnknownVariable)?;
        let variable_type = VariableType::from_name(declared.as_str().unwrap_or("string"));

        let reply = self
            .request_reply(
                MessageName::VariableRequest,
                &Params::new().with_field("name", name),
                &[],
            )
            .await?;
        from_binary(&reply.payload, variable_type)
    }

    /// Call a device function; the return payload decodes as int32.
    pub async fn call_function(&self, name: &str, args: &[String]) -> Result<DeviceValue> {
        self.ensure_unlocked().await?;
        let introspection = self.ensure_introspection().await?;

        let arg_spec = resolve_arg_spec(&introspection.function_state, name)
            .ok_or(CoreError::UnknownFunction)?;
        let encoded = build_arguments(args, &arg_spec)?;
        let query = String::from_utf8_lossy(&encoded).into_owned();

        let reply = self
            .request_reply(
                MessageName::FunctionCall,
                &Params::new().with_field("name", name).with_field("args", query),
                &[],
            )
            .await?;
        from_binary(&reply.payload, VariableType::Int32)
    }

    /// Toggle the device's visual signal (the rainbow).
    pub async fn raise_signal(&self, on: bool) -> Result<()> {
        self.ensure_unlocked().await?;
        self.request_reply(
            MessageName::SignalStart,
            &Params::new().with_field("signal", if on { "1" } else { "0" }),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Forward a cloud event to the device as a PublicEvent or
    /// PrivateEvent frame, carrying the ttl as Max-Age.
    pub async fn on_core_event(&self, event: &CloudEvent) -> Result<()> {
        self.ensure_unlocked().await?;

        let name = if event.is_public {
            MessageName::PublicEvent
        } else {
            MessageName::PrivateEvent
        };
        let params = Params::new()
            .with_field("name", event.name.clone())
            .with_max_age(event.ttl);
        let payload = event.data.clone().unwrap_or_default();

        match self.send_message(name, &params, &payload, SendAuth::Verb).await? {
            SendOutcome::Sent { .. } => Ok(()),
            SendOutcome::Refused => Err(self.refusal_error().await),
        }
    }

    /// Fetch introspection if absent; both halves are stored together.
    pub(crate) async fn ensure_introspection(&self) -> Result<Introspection> {
        if let Some(introspection) = self.introspection_cached().await {
            return Ok(introspection);
        }

        // One Describe, two possible responses: the system document,
        // then the application state if the first lacked it. Both
        // waiters register before the request hits the wire.
        let timeout = self.config().protocol.listener_timeout();
        let result = self
            .send_listening(MessageName::Describe, &Params::new(), &[], SendAuth::Verb, 2)
            .await?;
        if result.outcome == SendOutcome::Refused {
            return Err(self.refusal_error().await);
        }
        let mut handles = result.handles;
        let second_handle = handles.pop().ok_or(CoreError::NoDeviceState)?;
        let first_handle = handles.pop().ok_or(CoreError::NoDeviceState)?;

        let first = match self.bus().wait(first_handle, timeout).await {
            Ok(first) => first,
            Err(err) => {
                self.bus().cancel(&second_handle);
                return Err(err);
            }
        };
        let system: Value = serde_json::from_slice(&first.payload)?;

        let mut function_state = if system.get("f").is_some() && system.get("v").is_some() {
            self.bus().cancel(&second_handle);
            system.clone()
        } else {
            let second = self.bus().wait(second_handle, timeout).await?;
            serde_json::from_slice(&second.payload)?
        };

        if let Some(variables) = function_state.get("v").and_then(Value::as_object) {
            let translated = translate_int_types(variables);
            function_state["v"] = Value::Object(translated);
        }

        let introspection = Introspection {
            system_information: system,
            function_state,
        };
        self.store_introspection(introspection.clone()).await;
        Ok(introspection)
    }

    /// Send a token-bearing request and await its response, translating
    /// the refusal sentinel into the verb-level error.
    async fn request_reply(
        &self,
        name: MessageName,
        params: &Params,
        payload: &[u8],
    ) -> Result<crate::coap::Message> {
        let result = self
            .send_listening(name, params, payload, SendAuth::Verb, 1)
            .await?;
        if result.outcome == SendOutcome::Refused {
            return Err(self.refusal_error().await);
        }
        let handle = result
            .handles
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Protocol(format!("{name} has no response type")))?;
        self.bus()
            .wait(handle, self.config().protocol.listener_timeout())
            .await
    }

    async fn refusal_error(&self) -> CoreError {
        if self.ensure_unlocked().await.is_err() {
            CoreError::FlashInProgress
        } else {
            CoreError::NotReady
        }
    }
}

/// Resolve the argument signature for a function call.
///
/// New-form describes carry `{"<fn>": {"args": [["pin", "String"], ...]}}`;
/// old firmware only lists names under `"f"`, matched case-insensitively
/// and taking a single opaque string argument.
fn resolve_arg_spec(function_state: &Value, name: &str) -> Option<ArgSpec> {
    if let Some(args) = function_state
        .get(name)
        .and_then(|entry| entry.get("args"))
        .and_then(Value::as_array)
    {
        let mut spec = ArgSpec::new();
        for slot in args {
            let slot = slot.as_array()?;
            let slot_name = slot.first().and_then(Value::as_str).map(str::to_string);
            let slot_type = slot
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("String")
                .to_string();
            spec.push((slot_name, slot_type));
        }
        return Some(spec);
    }

    let functions = function_state.get("f").and_then(Value::as_array)?;
    let wanted = name.to_ascii_lowercase();
    functions
        .iter()
        .filter_map(Value::as_str)
        .find(|function| function.to_ascii_lowercase() == wanted)
        .map(|_| vec![(None, "String".to_string())])
}
