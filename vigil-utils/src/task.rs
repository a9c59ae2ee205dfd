//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio::{task, time};
use tracing::{Instrument, error};

/// A handle which can be used to manipulate the task created by the
/// [`Task::spawn`] function.
///
/// By default, dropping this handle cancels the task (unless
/// [`Task::detach`] is used).
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

/// A handle for a one-shot timer created by [`TimeoutTask::new`].
///
/// The timer can be re-armed with a new duration at any time, including
/// after it has already fired. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimeoutTask {
    #[cfg(not(feature = "testing"))]
    inner: TimeoutTaskInner,
}

#[derive(Debug)]
struct TimeoutTaskInner {
    _task: Task<()>,
    control: UnboundedSender<TimerCommand>,
    deadline: Arc<Mutex<Instant>>,
}

#[derive(Debug)]
enum TimerCommand {
    Rearm(Duration),
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    /// Spawns a supervised task that automatically restarts if it panics.
    /// The task will terminate if it completes successfully or returns an
    /// error.
    ///
    /// Intended for long-running network receive loops exposed to arbitrary
    /// input, where discarding the offending packet and keeping the loop
    /// alive is preferable to taking down the whole daemon.
    pub fn spawn_supervised<F, Fut>(spawn_fn: F) -> Task<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let join_handle = tokio::spawn(
            async move {
                loop {
                    let worker_task = Task::spawn(spawn_fn());
                    match worker_task.await {
                        Ok(_) => {
                            // Finished without panic.
                            break;
                        }
                        Err(error) if error.is_panic() => {
                            error!("task panicked, restarting...");
                            continue;
                        }
                        Err(error) => {
                            error!(%error, "task failed");
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );
        Task {
            join_handle,
            detached: false,
        }
    }

    /// Detach the task, meaning it will no longer be canceled if its handle
    /// is dropped.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a new task that will call the provided async closure when the
    /// specified timeout expires.
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let deadline = Arc::new(Mutex::new(Instant::now() + timeout));
        let deadline_child = deadline.clone();

        let task = Task::spawn(
            timer_loop(timeout, cb, control_rx, deadline_child)
                .in_current_span(),
        );

        TimeoutTask {
            inner: TimeoutTaskInner {
                _task: task,
                control: control_tx,
                deadline,
            },
        }
    }

    #[cfg(feature = "testing")]
    pub fn new<F, Fut>(_timeout: Duration, _cb: F) -> TimeoutTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        TimeoutTask {}
    }

    /// Re-arms the timer with a new duration, regardless of whether it has
    /// already fired or not.
    pub fn rearm(&mut self, timeout: Duration) {
        #[cfg(not(feature = "testing"))]
        {
            if self
                .inner
                .control
                .send(TimerCommand::Rearm(timeout))
                .is_err()
            {
                error!("failed to rearm timer");
            }
        }
    }

    /// Returns the remaining time before the timer fires.
    pub fn remaining(&self) -> Duration {
        #[cfg(not(feature = "testing"))]
        {
            let deadline = self.inner.deadline.lock().unwrap();
            deadline.saturating_duration_since(Instant::now())
        }
        #[cfg(feature = "testing")]
        {
            Duration::ZERO
        }
    }
}

#[cfg(not(feature = "testing"))]
async fn timer_loop<F, Fut>(
    timeout: Duration,
    mut cb: F,
    mut control_rx: mpsc::UnboundedReceiver<TimerCommand>,
    deadline: Arc<Mutex<Instant>>,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let sleep = time::sleep(timeout);
    tokio::pin!(sleep);
    let mut fired = false;

    loop {
        tokio::select! {
            // Timer has expired.
            _ = &mut sleep, if !fired => {
                fired = true;
                (cb)().await;
            }
            command = control_rx.recv() => {
                match command {
                    // Timer has been re-armed.
                    Some(TimerCommand::Rearm(timeout)) => {
                        let next = Instant::now() + timeout;
                        sleep.as_mut().reset(next);
                        *deadline.lock().unwrap() = next;
                        fired = false;
                    }
                    // Handle was dropped; cancel the timer.
                    None => break,
                }
            }
        }
    }
}
