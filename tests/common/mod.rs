//! Activities shared by the integration tests

#![allow(dead_code)]

use corewf::runtime::{
    Activity, AsyncCodeActivity, AsyncCodeActivityContext, AsyncOperation, Bookmark,
    BookmarkOptions, CallbackTag, CodeActivity, CodeActivityContext, CompletedChild, Extensions,
    FaultContext, FaultHandling, FaultInfo, NativeActivity, NativeActivityContext,
    ScheduleOptions, Value, Variable,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Ordered log shared between activities and the test body
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Manually completed asynchronous operations
#[derive(Debug, Default)]
pub struct PendingOperations {
    operations: Mutex<Vec<AsyncOperation>>,
}

impl PendingOperations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<AsyncOperation> {
        std::mem::take(&mut *self.operations.lock())
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }
}

pub fn extensions(journal: &Arc<Journal>) -> Extensions {
    let mut extensions = Extensions::new();
    extensions.add_shared(Arc::clone(journal));
    extensions
}

fn journal(ctx: &corewf::runtime::ActivityContext<'_>, entry: impl Into<String>) {
    if let Some(journal) = ctx.get_extension::<Journal>() {
        journal.push(entry);
    }
}

/// Writes its label to the journal and returns it
pub struct Record(pub &'static str);

impl CodeActivity for Record {
    fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
        journal(ctx, self.0);
        Ok(Some(Value::symbol(self.0)))
    }
}

pub fn record(label: &'static str) -> Activity {
    Activity::code(label, Record(label))
}

/// Fails with a message
pub struct Throw(pub &'static str);

impl CodeActivity for Throw {
    fn execute(&self, _ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("{}", self.0)
    }
}

pub fn throw(message: &'static str) -> Activity {
    Activity::code("throw", Throw(message))
}

/// Panics inside activity code
pub struct Explode;

impl CodeActivity for Explode {
    fn execute(&self, _ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
        panic!("kaboom")
    }
}

/// Runs children one after another
pub struct Sequence;

impl NativeActivity for Sequence {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        if let Some(first) = ctx.children().first().copied() {
            ctx.schedule_activity(first, Some(CallbackTag::from("next")))?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        child: &CompletedChild,
    ) -> anyhow::Result<()> {
        if ctx.is_cancel_requested() {
            return Ok(());
        }
        let children = ctx.children();
        let next = children
            .iter()
            .position(|id| *id == child.activity)
            .and_then(|index| children.get(index + 1))
            .copied();
        if let Some(next) = next {
            ctx.schedule_activity(next, Some(CallbackTag::from("next")))?;
        }
        Ok(())
    }
}

pub fn sequence(name: &str, children: impl IntoIterator<Item = Activity>) -> Activity {
    Activity::native(name, Sequence).with_children(children)
}

/// Runs every child at once
pub struct Parallel;

impl NativeActivity for Parallel {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        for child in ctx.children() {
            ctx.schedule_activity(child, None)?;
        }
        Ok(())
    }
}

pub fn parallel(name: &str, children: impl IntoIterator<Item = Activity>) -> Activity {
    Activity::native(name, Parallel).with_children(children)
}

/// Runs every child at once and cancels the rest when the first one closes
pub struct Race;

impl NativeActivity for Race {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        for child in ctx.children() {
            ctx.schedule_activity(child, Some(CallbackTag::from("finished")))?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        child: &CompletedChild,
    ) -> anyhow::Result<()> {
        journal(ctx, format!("finished:{:?}", child.state));
        if child.state == corewf::runtime::ActivityInstanceState::Closed {
            if let Some(result) = &child.result {
                ctx.set_result(result.clone());
            }
            ctx.cancel_children();
        }
        Ok(())
    }
}

/// Waits for one resumption of a named bookmark
pub struct WaitForBookmark(pub &'static str);

impl NativeActivity for WaitForBookmark {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        ctx.create_bookmark(self.0, Some(CallbackTag::from("resumed")))?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        bookmark: &Bookmark,
        value: Value,
    ) -> anyhow::Result<()> {
        journal(ctx, format!("resumed:{}", bookmark.name));
        ctx.set_result(value);
        Ok(())
    }

    fn abort(&self, _reason: &FaultInfo) {
        ABORTED.lock().push(self.0);
    }
}

/// Names of waits whose abort hook ran, across every test in the binary
pub static ABORTED: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

pub fn wait(name: &'static str) -> Activity {
    Activity::native(name, WaitForBookmark(name))
}

/// Counts resumptions of a multiple-resume bookmark and closes after `until`
pub struct Listen {
    pub name: &'static str,
    pub until: i64,
}

impl NativeActivity for Listen {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        ctx.create_bookmark_with(
            self.name,
            Some(CallbackTag::from("heard")),
            BookmarkOptions::multiple_resume(),
        )?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        bookmark: &Bookmark,
        value: Value,
    ) -> anyhow::Result<()> {
        let count = ctx
            .get_value("count")?
            .as_signed_integer()
            .and_then(|n| i64::try_from(n.as_ref()).ok())
            .unwrap_or(0)
            + 1;
        ctx.set_value("count", Value::new(count))?;
        journal(ctx, format!("heard:{:?}", value));
        if count >= self.until {
            ctx.remove_bookmark(bookmark);
            ctx.set_result(Value::new(count));
        }
        Ok(())
    }
}

pub fn listen(name: &'static str, until: i64) -> Activity {
    Activity::native(name, Listen { name, until })
        .with_variable(Variable::with_default("count", Value::new(0i64)))
}

/// Waits on a blocking bookmark while accepting status pings on a
/// non-blocking one
pub struct Approval;

impl NativeActivity for Approval {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        ctx.create_bookmark_with(
            "status",
            Some(CallbackTag::from("status")),
            BookmarkOptions {
                multiple_resume: true,
                non_blocking: true,
            },
        )?;
        ctx.create_bookmark("approve", Some(CallbackTag::from("approve")))?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        callback: &CallbackTag,
        _bookmark: &Bookmark,
        value: Value,
    ) -> anyhow::Result<()> {
        journal(ctx, callback.as_str());
        if callback.as_str() == "approve" {
            ctx.set_result(value);
        }
        Ok(())
    }
}

/// Schedules its single child inside a fresh bookmark scope
pub struct Scoped;

impl NativeActivity for Scoped {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        let scope = ctx.create_bookmark_scope()?;
        for child in ctx.children() {
            ctx.schedule_activity_with(child, ScheduleOptions::new().in_scope(scope))?;
        }
        Ok(())
    }
}

/// Runs its first child and absorbs any fault it raises
pub struct TryCatch;

impl NativeActivity for TryCatch {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        if let Some(body) = ctx.children().first().copied() {
            ctx.schedule_activity_with(
                body,
                ScheduleOptions::new()
                    .on_completed("done")
                    .on_faulted("catch"),
            )?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        child: &CompletedChild,
    ) -> anyhow::Result<()> {
        journal(ctx, format!("done:{:?}", child.state));
        Ok(())
    }

    fn on_child_faulted(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _callback: &CallbackTag,
        fault: &FaultContext,
    ) -> anyhow::Result<FaultHandling> {
        journal(ctx, format!("caught:{}", fault.fault.message()));
        Ok(FaultHandling::Handled)
    }
}

pub fn try_catch(body: Activity) -> Activity {
    Activity::native("try", TryCatch).with_child(body)
}

/// Completes with its `value` argument after a short delay on the tokio runtime
pub struct AsyncEcho;

impl AsyncCodeActivity for AsyncEcho {
    fn begin_execute(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        operation: AsyncOperation,
    ) -> anyhow::Result<()> {
        let value = ctx.argument("value")?;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = operation.succeed(value);
        });
        Ok(())
    }
}

/// Fails after a short delay on the tokio runtime
pub struct AsyncFail;

impl AsyncCodeActivity for AsyncFail {
    fn begin_execute(
        &self,
        _ctx: &mut AsyncCodeActivityContext<'_>,
        operation: AsyncOperation,
    ) -> anyhow::Result<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = operation.fail(anyhow::anyhow!("remote call failed"));
        });
        Ok(())
    }
}

/// Parks its operation in [`PendingOperations`] for the test to complete
pub struct Deferred;

impl AsyncCodeActivity for Deferred {
    fn begin_execute(
        &self,
        ctx: &mut AsyncCodeActivityContext<'_>,
        operation: AsyncOperation,
    ) -> anyhow::Result<()> {
        let pending = ctx
            .get_extension::<PendingOperations>()
            .ok_or_else(|| anyhow::anyhow!("no pending operation registry"))?;
        pending.operations.lock().push(operation);
        Ok(())
    }

    fn end_execute(
        &self,
        ctx: &mut CodeActivityContext<'_>,
        result: Value,
    ) -> anyhow::Result<Option<Value>> {
        journal(ctx, "deferred-ended");
        Ok(Some(result))
    }
}
