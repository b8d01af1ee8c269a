//! Activity definitions: kinds, bodies, variables and arguments
//!
//! An [`Activity`] is the authoring-time description of a node in the
//! workflow tree. It is consumed by
//! [`WorkflowDefinition::prepare`](super::definition::WorkflowDefinition::prepare),
//! after which the tree is immutable and shared by every instance that runs it.
//!
//! Behavior is supplied through one of three narrow traits, selected by the
//! [`ActivityKind`] tag:
//! - [`CodeActivity`]: synchronous, side-effect-only code that cannot schedule
//! - [`NativeActivity`]: full access to scheduling, bookmarks and callbacks
//! - [`AsyncCodeActivity`]: begins an operation that completes off-thread

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::bookmark::Bookmark;
use super::context::{
    AsyncCodeActivityContext, AsyncOperation, CodeActivityContext, NativeActivityContext,
};
use super::definition::ActivityMetadata;
use super::fault::{FaultContext, FaultHandling, FaultInfo};
use super::instance::CompletedChild;
use super::value::Value;

/// Identifies which method of the owning activity receives a callback
///
/// Callbacks are never closures: a tag is resolved against the owner
/// instance's activity definition when the callback fires, so pending
/// callbacks survive persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackTag(pub String);

impl CallbackTag {
    /// Create a tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallbackTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl fmt::Display for CallbackTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Synchronous activity body with no scheduling capability
pub trait CodeActivity: Send + Sync {
    /// Contribute validation findings and declared bookmarks
    fn cache_metadata(&self, _metadata: &mut ActivityMetadata<'_>) {}

    /// Run the body; the returned value becomes the instance result
    fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>>;

    /// Type name used in definition fingerprints
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Activity body with full access to the scheduler
pub trait NativeActivity: Send + Sync {
    /// Contribute validation findings and declared bookmarks
    fn cache_metadata(&self, _metadata: &mut ActivityMetadata<'_>) {}

    /// Run the body
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()>;

    /// A child scheduled with a completion callback reached a terminal state
    fn on_child_completed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        _child: &CompletedChild,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A child scheduled with a fault callback faulted
    ///
    /// Returning [`FaultHandling::Propagate`] faults this instance with the
    /// same fault and continues propagation upward.
    fn on_child_faulted(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        _fault: &FaultContext,
    ) -> anyhow::Result<FaultHandling> {
        Ok(FaultHandling::Propagate)
    }

    /// A bookmark created with a callback was resumed
    fn on_bookmark_resumed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        _bookmark: &Bookmark,
        _value: Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cancellation was requested
    ///
    /// The default drops this instance's bookmarks, marks it canceled and
    /// propagates cancellation to every running child.
    fn cancel(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        ctx.remove_all_bookmarks();
        ctx.mark_canceled()?;
        ctx.cancel_children();
        Ok(())
    }

    /// The instance is being torn down because an ancestor faulted
    fn abort(&self, _reason: &FaultInfo) {}

    /// Type name used in definition fingerprints
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Activity body whose work completes outside the scheduler turn
pub trait AsyncCodeActivity: Send + Sync {
    /// Contribute validation findings
    fn cache_metadata(&self, _metadata: &mut ActivityMetadata<'_>) {}

    /// Start the operation; complete it later through `operation`
    fn begin_execute(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        operation: AsyncOperation,
    ) -> anyhow::Result<()>;

    /// Operation completed; the returned value becomes the instance result
    fn end_execute(
        &self,
        _ctx: &mut CodeActivityContext<'_>,
        result: Value,
    ) -> anyhow::Result<Option<Value>> {
        Ok(Some(result))
    }

    /// Cancellation was requested while the operation is outstanding
    ///
    /// The default marks the instance canceled, which abandons the operation.
    fn cancel(&self, ctx: &mut AsyncCodeActivityContext<'_>) -> anyhow::Result<()> {
        ctx.mark_canceled()?;
        Ok(())
    }

    /// The instance is being torn down because an ancestor faulted
    fn abort(&self, _reason: &FaultInfo) {}

    /// Type name used in definition fingerprints
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Tagged activity body
#[derive(Clone)]
pub enum ActivityKind {
    /// Synchronous side-effect-only body
    Code(Arc<dyn CodeActivity>),
    /// Body with scheduling capabilities
    Native(Arc<dyn NativeActivity>),
    /// Body that completes asynchronously
    Async(Arc<dyn AsyncCodeActivity>),
}

impl ActivityKind {
    /// Short tag used in fingerprints and records
    pub fn tag(&self) -> &'static str {
        match self {
            ActivityKind::Code(_) => "code",
            ActivityKind::Native(_) => "native",
            ActivityKind::Async(_) => "async",
        }
    }

    /// Type name of the body
    pub fn type_name(&self) -> &'static str {
        match self {
            ActivityKind::Code(body) => body.type_name(),
            ActivityKind::Native(body) => body.type_name(),
            ActivityKind::Async(body) => body.type_name(),
        }
    }

    pub(crate) fn cache_metadata(&self, metadata: &mut ActivityMetadata<'_>) {
        match self {
            ActivityKind::Code(body) => body.cache_metadata(metadata),
            ActivityKind::Native(body) => body.cache_metadata(metadata),
            ActivityKind::Async(body) => body.cache_metadata(metadata),
        }
    }
}

impl fmt::Debug for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tag(), self.type_name())
    }
}

/// A variable declared on an activity
#[derive(Debug, Clone)]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Initial value; unset variables start as [`null`](super::value::null)
    pub default: Option<Value>,
}

impl Variable {
    /// Declare a variable with no initial value
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// Declare a variable with an initial value
    pub fn with_default(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(value),
        }
    }
}

/// Data flow direction of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentDirection {
    /// Value flows from the parent into the activity
    In,
    /// Value flows from the activity back to the parent
    Out,
    /// Both
    InOut,
}

impl ArgumentDirection {
    /// True for In and InOut
    pub fn is_input(self) -> bool {
        matches!(self, ArgumentDirection::In | ArgumentDirection::InOut)
    }

    /// True for Out and InOut
    pub fn is_output(self) -> bool {
        matches!(self, ArgumentDirection::Out | ArgumentDirection::InOut)
    }
}

/// Where an argument gets its value
#[derive(Debug, Clone)]
pub enum ArgumentBinding {
    /// Fixed value (In only)
    Literal(Value),
    /// A variable or argument visible from the parent
    Variable(String),
    /// No binding; starts as null unless the parent supplies a value when
    /// scheduling. Required child arguments cannot be unbound.
    Unbound,
}

/// An argument declared on an activity
#[derive(Debug, Clone)]
pub struct Argument {
    /// Argument name
    pub name: String,
    /// Direction
    pub direction: ArgumentDirection,
    /// Whether a binding must exist
    pub required: bool,
    /// Binding
    pub binding: ArgumentBinding,
}

impl Argument {
    fn new(name: impl Into<String>, direction: ArgumentDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            required: false,
            binding: ArgumentBinding::Unbound,
        }
    }

    /// Declare an In argument
    pub fn input(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentDirection::In)
    }

    /// Declare an Out argument
    pub fn output(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentDirection::Out)
    }

    /// Declare an InOut argument
    pub fn in_out(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentDirection::InOut)
    }

    /// Mark the argument as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Bind to a literal value
    pub fn bind_literal(mut self, value: Value) -> Self {
        self.binding = ArgumentBinding::Literal(value);
        self
    }

    /// Bind to a location visible from the parent
    pub fn bind_variable(mut self, name: impl Into<String>) -> Self {
        self.binding = ArgumentBinding::Variable(name.into());
        self
    }
}

/// Authoring-time activity tree node
pub struct Activity {
    pub(crate) display_name: String,
    pub(crate) kind: ActivityKind,
    pub(crate) children: Vec<Activity>,
    pub(crate) variables: Vec<Variable>,
    pub(crate) arguments: Vec<Argument>,
}

impl Activity {
    /// Create an activity from a tagged body
    pub fn new(display_name: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            display_name: display_name.into(),
            kind,
            children: Vec::new(),
            variables: Vec::new(),
            arguments: Vec::new(),
        }
    }

    /// Create a code activity
    pub fn code(display_name: impl Into<String>, body: impl CodeActivity + 'static) -> Self {
        Self::new(display_name, ActivityKind::Code(Arc::new(body)))
    }

    /// Create a native activity
    pub fn native(display_name: impl Into<String>, body: impl NativeActivity + 'static) -> Self {
        Self::new(display_name, ActivityKind::Native(Arc::new(body)))
    }

    /// Create an asynchronous code activity
    pub fn asynchronous(
        display_name: impl Into<String>,
        body: impl AsyncCodeActivity + 'static,
    ) -> Self {
        Self::new(display_name, ActivityKind::Async(Arc::new(body)))
    }

    /// Add a declared child
    pub fn with_child(mut self, child: Activity) -> Self {
        self.children.push(child);
        self
    }

    /// Add several declared children, in order
    pub fn with_children(mut self, children: impl IntoIterator<Item = Activity>) -> Self {
        self.children.extend(children);
        self
    }

    /// Declare a variable
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Declare an argument
    pub fn with_argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Rename the activity
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("display_name", &self.display_name)
            .field("kind", &self.kind)
            .field("children", &self.children)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl CodeActivity for Noop {
        fn execute(&self, _ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
    }

    #[test]
    fn test_builder_collects_children_in_order() {
        let activity = Activity::code("root", Noop)
            .with_child(Activity::code("a", Noop))
            .with_children(vec![Activity::code("b", Noop), Activity::code("c", Noop)]);

        let names: Vec<&str> = activity.children.iter().map(|c| c.display_name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_kind_tag_and_type_name() {
        let activity = Activity::code("noop", Noop);
        assert_eq!(activity.kind.tag(), "code");
        assert!(activity.kind.type_name().ends_with("Noop"));
    }

    #[test]
    fn test_argument_directions() {
        assert!(ArgumentDirection::In.is_input());
        assert!(!ArgumentDirection::In.is_output());
        assert!(ArgumentDirection::InOut.is_input());
        assert!(ArgumentDirection::InOut.is_output());
        assert!(Argument::output("r").direction.is_output());
    }
}
