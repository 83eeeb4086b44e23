//! Cancellable one-shot and recurring tasks on top of the dispatcher.

use log::{debug, warn};

use crate::context::ContextHandle;
use crate::dispatcher::{Dispatch, TimeEventId};
use crate::registry::HandleRegistry;
use crate::state::{Result, State};

/// Handle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimedTaskHandle(pub i32);

/// Task body. Receives the owning context, the context handle the task was
/// scheduled for and its own handle.
pub type TaskCallback<C> = Box<dyn FnMut(&mut C, ContextHandle, TimedTaskHandle)>;

/// How many times a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    Count(u32),
    Forever,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Scheduled,
    Running,
    Deletable,
}

struct TimedTask<C> {
    context: ContextHandle,
    callback: Option<TaskCallback<C>>,
    period: i64,
    remaining: Option<u32>,
    state: TaskState,
    event: Option<TimeEventId>,
}

/// Owner of every timed task.
pub struct TimedTaskContainer<C> {
    tasks: HandleRegistry<TimedTask<C>>,
}

impl<C> TimedTaskContainer<C> {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tasks: HandleRegistry::with_capacity(max_tasks),
        }
    }

    /// Live tasks, including one currently running.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, handle: TimedTaskHandle) -> bool {
        self.tasks.contains(handle.0)
    }

    /// Handles of tasks scheduled for `context`.
    pub fn handles_for(&self, context: ContextHandle) -> Vec<TimedTaskHandle> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.context == context)
            .map(|(handle, _)| TimedTaskHandle(handle))
            .collect()
    }

    pub fn handles(&self) -> Vec<TimedTaskHandle> {
        self.tasks.handles().into_iter().map(TimedTaskHandle).collect()
    }
}

/// Access to the task container embedded in a context.
pub trait TimedTasks: Dispatch {
    fn timed_tasks(&mut self) -> &mut TimedTaskContainer<Self>;
}

/// Schedule `callback` to run every `period` steps, `repeat` times.
pub fn add_timed_task<C: TimedTasks>(
    cx: &mut C,
    context: ContextHandle,
    callback: TaskCallback<C>,
    period: i64,
    repeat: Repeat,
) -> Result<TimedTaskHandle> {
    let remaining = match repeat {
        Repeat::Once => Some(1),
        Repeat::Count(0) => return Err(State::InvalidParameter),
        Repeat::Count(n) => Some(n),
        Repeat::Forever => None,
    };
    if period < 0 {
        return Err(State::InvalidParameter);
    }

    let handle = cx.timed_tasks().tasks.insert(TimedTask {
        context,
        callback: Some(callback),
        period,
        remaining,
        state: TaskState::Scheduled,
        event: None,
    })?;
    let handle = TimedTaskHandle(handle);

    match schedule(cx, handle, period) {
        Ok(()) => {
            debug!("timed task {} scheduled every {} steps", handle.0, period);
            Ok(handle)
        }
        Err(state) => {
            cx.timed_tasks().tasks.remove(handle.0);
            Err(state)
        }
    }
}

/// Cancel a task. Safe to call from inside the task's own callback, in
/// which case it does not fire again.
pub fn remove_timed_task<C: TimedTasks>(cx: &mut C, handle: TimedTaskHandle) -> Result<()> {
    let task = cx
        .timed_tasks()
        .tasks
        .get_mut(handle.0)
        .ok_or(State::ElementNotFound)?;
    match task.state {
        TaskState::Running => {
            task.state = TaskState::Deletable;
            Ok(())
        }
        TaskState::Deletable => Ok(()),
        TaskState::Scheduled => {
            let event = task.event.take();
            cx.timed_tasks().tasks.remove(handle.0);
            if let Some(event) = event {
                cx.dispatcher().cancel(event)?;
            }
            Ok(())
        }
    }
}

/// Cancel every task scheduled for `context`.
pub fn remove_context_tasks<C: TimedTasks>(cx: &mut C, context: ContextHandle) {
    for handle in cx.timed_tasks().handles_for(context) {
        let _ = remove_timed_task(cx, handle);
    }
}

/// Cancel every task.
pub fn clear_timed_tasks<C: TimedTasks>(cx: &mut C) {
    for handle in cx.timed_tasks().handles() {
        let _ = remove_timed_task(cx, handle);
    }
}

fn schedule<C: TimedTasks>(cx: &mut C, handle: TimedTaskHandle, delay: i64) -> Result<()> {
    let event = cx
        .dispatcher()
        .execute_in(Box::new(move |cx: &mut C| fire(cx, handle)), delay)?;
    if let Some(task) = cx.timed_tasks().tasks.get_mut(handle.0) {
        task.event = Some(event);
    }
    Ok(())
}

fn fire<C: TimedTasks>(cx: &mut C, handle: TimedTaskHandle) -> State {
    let Some(task) = cx.timed_tasks().tasks.get_mut(handle.0) else {
        return State::Ok;
    };
    let Some(mut callback) = task.callback.take() else {
        return State::Ok;
    };
    task.event = None;
    task.state = TaskState::Running;
    if let Some(remaining) = task.remaining.as_mut() {
        *remaining = remaining.saturating_sub(1);
    }
    let context = task.context;

    callback(cx, context, handle);

    let container = cx.timed_tasks();
    let Some(task) = container.tasks.get_mut(handle.0) else {
        return State::Ok;
    };
    if task.state == TaskState::Deletable || task.remaining == Some(0) {
        container.tasks.remove(handle.0);
        return State::Ok;
    }
    task.callback = Some(callback);
    task.state = TaskState::Scheduled;
    let period = task.period;

    if let Err(state) = schedule(cx, handle, period) {
        warn!("timed task {} could not be rescheduled: {}", handle.0, state);
        cx.timed_tasks().tasks.remove(handle.0);
        return state;
    }
    State::Ok
}
