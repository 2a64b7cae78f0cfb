//! Deferred method calls.
//!
//! A [`DeferredCall`] names a registered `(target, method)` pair plus a list of
//! tagged arguments. It is stored as JSON in the payload of a job named
//! [`DEFERRED_CALL_JOB`] and resolved against a [`CallRegistry`] when that job
//! runs. Cron schedules always enqueue deferred calls.

use crate::errors::CodecError;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Job name under which deferred calls are stored.
pub const DEFERRED_CALL_JOB: &str = "deferred_call";

/// Payload key holding the encoded descriptor.
pub const DESCRIPTOR_KEY: &str = "descriptor";

/// A single argument of a deferred call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallArg {
    /// No value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    String(String),
    /// A UUID.
    Uuid(Uuid),
    /// A point in time.
    DateTime(DateTime<Utc>),
    /// Arbitrary JSON.
    Json(Value),
}

impl CallArg {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Uuid(_) => "uuid",
            Self::DateTime(_) => "datetime",
            Self::Json(_) => "json",
        }
    }
}

macro_rules! call_arg_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for CallArg {
                fn from(value: $ty) -> Self {
                    Self::$variant((value $(as $cast)?).into())
                }
            }
        )*
    };
}

call_arg_from! {
    bool => Bool,
    i32 => Int as i64,
    i64 => Int,
    u32 => Int as i64,
    f64 => Float,
    String => String,
    &str => String,
    Uuid => Uuid,
    DateTime<Utc> => DateTime,
    Value => Json,
}

impl<T: Into<CallArg>> From<Option<T>> for CallArg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A method call to perform later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredCall {
    /// The registered target, usually a service name.
    pub target: String,
    /// The method on the target.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<CallArg>,
}

impl DeferredCall {
    /// A call without arguments.
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<CallArg>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Encode a call as a descriptor string.
pub fn encode(call: &DeferredCall) -> Result<String, serde_json::Error> {
    serde_json::to_string(call)
}

/// Decode a descriptor string.
pub fn decode(descriptor: &str) -> Result<DeferredCall, CodecError> {
    serde_json::from_str(descriptor).map_err(CodecError::MalformedDescriptor)
}

/// Conversion from a [`CallArg`] into a handler argument.
pub trait FromCallArg: Sized {
    /// Convert, or return `None` when the argument has a different type.
    fn from_call_arg(arg: &CallArg) -> Option<Self>;
}

impl FromCallArg for bool {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromCallArg for i64 {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromCallArg for i32 {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        i64::from_call_arg(arg).and_then(|value| i32::try_from(value).ok())
    }
}

impl FromCallArg for f64 {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            CallArg::Int(value) => Some(*value as f64),
            _ => None,
        }
    }
}

impl FromCallArg for String {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::String(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl FromCallArg for Uuid {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Uuid(value) => Some(*value),
            CallArg::String(value) => value.parse().ok(),
            _ => None,
        }
    }
}

impl FromCallArg for DateTime<Utc> {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::DateTime(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromCallArg for Value {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Json(value) => Some(value.clone()),
            CallArg::Null => Some(Value::Null),
            _ => None,
        }
    }
}

impl<T: FromCallArg> FromCallArg for Option<T> {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Null => Some(None),
            other => T::from_call_arg(other).map(Some),
        }
    }
}

/// The arguments of a call, as handed to its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs {
    method: String,
    args: Vec<CallArg>,
}

impl CallArgs {
    /// Read argument `index` as `T`.
    pub fn get<T: FromCallArg>(&self, index: usize) -> Result<T, CodecError> {
        let arg = self.args.get(index).ok_or_else(|| CodecError::ArgumentMismatch {
            method: self.method.clone(),
            index,
            reason: format!("only {} argument(s) given", self.args.len()),
        })?;

        T::from_call_arg(arg).ok_or_else(|| CodecError::ArgumentMismatch {
            method: self.method.clone(),
            index,
            reason: format!(
                "cannot convert {} into {}",
                arg.kind(),
                std::any::type_name::<T>()
            ),
        })
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

type CallFn<Context> =
    Arc<dyn Fn(Context, CallArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps `(target, method)` pairs to handlers.
pub struct CallRegistry<Context> {
    targets: HashMap<String, HashMap<String, CallFn<Context>>>,
}

impl<Context> Default for CallRegistry<Context> {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }
}

impl<Context> std::fmt::Debug for CallRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut calls = self
            .targets
            .iter()
            .flat_map(|(target, methods)| {
                methods.keys().map(move |method| format!("{target}.{method}"))
            })
            .collect::<Vec<_>>();
        calls.sort();

        f.debug_struct("CallRegistry").field("calls", &calls).finish()
    }
}

impl<Context: Send + 'static> CallRegistry<Context> {
    /// Register the handler of `target.method`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, target: &str, method: &str, handler: F)
    where
        F: Fn(Context, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: CallFn<Context> = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.targets
            .entry(target.to_string())
            .or_default()
            .insert(method.to_string(), handler);
    }

    /// Whether no calls are registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Decode `descriptor` and run the call it names.
    ///
    /// Resolution failures are [`CodecError`]s; otherwise the handler's own
    /// result is returned.
    pub async fn invoke(&self, descriptor: &str, ctx: Context) -> anyhow::Result<()> {
        let call = decode(descriptor)?;
        let handler = self.resolve(&call)?;

        let args = CallArgs {
            method: call.method,
            args: call.args,
        };
        handler(ctx, args).await
    }

    fn resolve(&self, call: &DeferredCall) -> Result<CallFn<Context>, CodecError> {
        let methods = self
            .targets
            .get(&call.target)
            .ok_or_else(|| CodecError::TypeNotFound(call.target.clone()))?;

        methods
            .get(&call.method)
            .cloned()
            .ok_or_else(|| CodecError::MethodNotFound {
                target: call.target.clone(),
                method: call.method.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn descriptor_format() {
        let call = DeferredCall::new("reports", "write_file")
            .arg("/tmp/report.txt")
            .arg(3)
            .arg(Option::<bool>::None);

        let descriptor = encode(&call).unwrap();
        let value: Value = serde_json::from_str(&descriptor).unwrap();
        assert_eq!(
            value,
            json!({
                "target": "reports",
                "method": "write_file",
                "args": [
                    { "type": "string", "value": "/tmp/report.txt" },
                    { "type": "int", "value": 3 },
                    { "type": "null" },
                ],
            })
        );

        assert_eq!(decode(&descriptor).unwrap(), call);
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        assert!(matches!(decode("not json"), Err(CodecError::MalformedDescriptor(_))));
        assert!(matches!(
            decode(r#"{"target": "reports"}"#),
            Err(CodecError::MalformedDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn invoke_resolves_target_and_method() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut registry = CallRegistry::default();
        registry.register("counter", "add", |seen: Arc<Mutex<Vec<i64>>>, args| async move {
            let amount: i64 = args.get(0)?;
            seen.lock().unwrap().push(amount);
            Ok::<_, anyhow::Error>(())
        });

        let call = DeferredCall::new("counter", "add").arg(5);
        assert_ok!(registry.invoke(&encode(&call).unwrap(), seen.clone()).await);
        assert_eq!(*seen.lock().unwrap(), vec![5]);

        let error = assert_err!(
            registry
                .invoke(&encode(&DeferredCall::new("missing", "add")).unwrap(), seen.clone())
                .await
        );
        assert_eq!(error.to_string(), "no calls registered for target `missing`");

        let error = assert_err!(
            registry
                .invoke(&encode(&DeferredCall::new("counter", "sub")).unwrap(), seen.clone())
                .await
        );
        assert_eq!(error.to_string(), "target `counter` has no method `sub`");

        let wrong_type = DeferredCall::new("counter", "add").arg("five");
        let error = assert_err!(registry.invoke(&encode(&wrong_type).unwrap(), seen).await);
        assert!(matches!(
            error.downcast_ref::<CodecError>(),
            Some(CodecError::ArgumentMismatch { index: 0, .. })
        ));
    }
}
