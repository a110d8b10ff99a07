//! Error types surfaced by the engine.
//!
//! Every fatal failure leaves `FlowEngine::execute` as a single
//! [`FlowExecutionError`]. Component errors ([`TemplateError`],
//! [`ContextError`], [`InstantiationError`]) convert into it with the matching
//! [`ErrorKind`].

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Boxed cause chained beneath a [`FlowExecutionError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Classification of a flow failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown flow, sub-flow, table, prompt, or `next_step` target.
    NotFound,
    /// A step or action payload lacks a required field.
    MissingRequiredField,
    /// Required-input check or strict model validation failed.
    Validation,
    /// A value could not be coerced into a primitive type.
    Coercion,
    /// Dice roller, name generator, or LLM client failure.
    Collaborator,
    /// Malformed template expression.
    Template,
    /// Invalid context write.
    Context,
    /// Missing input callback or a malformed selection.
    UserInput,
    /// Flow depth or step transition guard exceeded.
    RecursionLimit,
    /// Any other step failure.
    Execution,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::MissingRequiredField => "missing required field",
            ErrorKind::Validation => "validation failed",
            ErrorKind::Coercion => "coercion failed",
            ErrorKind::Collaborator => "collaborator failed",
            ErrorKind::Template => "template error",
            ErrorKind::Context => "context error",
            ErrorKind::UserInput => "user input error",
            ErrorKind::RecursionLimit => "recursion limit exceeded",
            ErrorKind::Execution => "execution failed",
        };
        f.write_str(label)
    }
}

/// Fatal flow failure, carrying the originating step when known.
#[derive(Debug, Error)]
#[error("{}", render_message(.step_id.as_deref(), .message))]
pub struct FlowExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub step_id: Option<String>,
    #[source]
    pub source: Option<BoxError>,
}

fn render_message(step_id: Option<&str>, message: &str) -> String {
    match step_id {
        Some(step_id) => format!("step '{step_id}': {message}"),
        None => message.to_string(),
    }
}

impl FlowExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: None,
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn missing_field(step_id: &str, field: &str) -> Self {
        Self::new(ErrorKind::MissingRequiredField, format!("missing required field '{field}'")).at_step(step_id)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn user_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserInput, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    /// Wraps a collaborator failure, keeping it as the source.
    pub fn collaborator(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Collaborator, message).with_source(source)
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_message_prefix(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }

    /// Attributes the error to `step_id` unless an inner step already claimed it.
    pub fn at_step(mut self, step_id: &str) -> Self {
        if self.step_id.is_none() {
            self.step_id = Some(step_id.to_string());
        }
        self
    }
}

/// Malformed or unevaluable template expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot resolve template '{template}': {message}")]
pub struct TemplateError {
    pub template: String,
    pub message: String,
}

impl TemplateError {
    pub fn new(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            message: message.into(),
        }
    }
}

/// Invalid execution context write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context path is empty")]
    EmptyPath,
    #[error("cannot overwrite reserved namespace '{0}'")]
    ReservedNamespace(String),
    #[error("cannot write '{path}': '{prefix}' is not a mapping")]
    NotAMapping { path: String, prefix: String },
    #[error("cannot write '{path}': index {index} is out of bounds")]
    IndexOutOfBounds { path: String, index: usize },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Model instantiation or primitive coercion failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InstantiationError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("{model} data must be a mapping")]
    NotAMapping { model: String },
    #[error("cannot convert {value} to {target}")]
    Coercion { value: String, target: String },
    #[error("unsupported primitive type '{0}'")]
    UnsupportedType(String),
    #[error("{model} validation failed: {}", .errors.join("; "))]
    Invalid { model: String, errors: Vec<String> },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<TemplateError> for FlowExecutionError {
    fn from(error: TemplateError) -> Self {
        FlowExecutionError::new(ErrorKind::Template, error.to_string()).with_source(error)
    }
}

impl From<ContextError> for FlowExecutionError {
    fn from(error: ContextError) -> Self {
        let kind = match &error {
            ContextError::Template(_) => ErrorKind::Template,
            _ => ErrorKind::Context,
        };
        FlowExecutionError::new(kind, error.to_string()).with_source(error)
    }
}

impl From<InstantiationError> for FlowExecutionError {
    fn from(error: InstantiationError) -> Self {
        let kind = match &error {
            InstantiationError::Coercion { .. } | InstantiationError::UnsupportedType(_) => ErrorKind::Coercion,
            InstantiationError::Template(_) => ErrorKind::Template,
            _ => ErrorKind::Validation,
        };
        FlowExecutionError::new(kind, error.to_string()).with_source(error)
    }
}
