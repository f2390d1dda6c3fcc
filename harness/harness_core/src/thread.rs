// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Child threads of a routine.

use crate::filament::Filament;
use crate::filament::FilamentBinder;
use crate::filament::FilamentError;
use crate::filament::FilamentRegistry;
use crate::guard::Guarded;
use crate::guard::run_guarded;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Errors from starting a child thread.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The calling thread has no filament, or the filament is full.
    #[error("filament error")]
    Filament(#[from] FilamentError),
    /// The operating system could not create the thread.
    #[error("failed to create thread")]
    Spawn(#[from] std::io::Error),
    /// The child thread ended before it could be bound.
    #[error("child thread exited before joining its filament")]
    Initialization,
}

/// Starts a child thread in the calling thread's filament.
///
/// Returns once the child is bound, so the routine cannot finish before its
/// child is tracked. The routine call waits for the child before returning,
/// and failures on the child fail the routine.
pub fn spawn_child_thread<B, F>(
    binder: &B,
    name: Option<String>,
    f: F,
) -> Result<JoinHandle<()>, SpawnError>
where
    B: FilamentBinder + Clone + 'static,
    F: FnOnce() + Send + 'static,
{
    let parent = binder.get_current(false)?;
    let filament = parent.filament.clone();

    let (init_send, init_recv) = mpsc::sync_channel(1);
    let child_binder = binder.clone();
    let child_filament = filament.clone();
    let mut builder = std::thread::Builder::new();
    if let Some(name) = name {
        builder = builder.name(name);
    }
    let handle = filament.context().create_child_thread(
        &parent.identity,
        builder,
        Box::new(move || run_child(child_binder, child_filament, init_send, f)),
    )?;

    match init_recv.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err.into())
        }
        Err(_) => {
            let _ = handle.join();
            Err(SpawnError::Initialization)
        }
    }
}

/// Starts a child thread of the routine running on the calling thread.
pub fn spawn<F>(f: F) -> Result<JoinHandle<()>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    spawn_child_thread(&FilamentRegistry::global().clone(), None, f)
}

fn run_child<B, F>(
    binder: B,
    filament: Arc<Filament>,
    init: mpsc::SyncSender<Result<(), FilamentError>>,
    f: F,
) where
    B: FilamentBinder,
    F: FnOnce(),
{
    let thread = filament.identity(std::thread::current().id());
    if let Err(err) = binder.set_current_filament(&filament) {
        let _ = init.send(Err(err));
        return;
    }
    let context = filament.context().clone();
    context.before_child_thread_start(&thread);
    let _ = init.send(Ok(()));

    let guarded = run_guarded(&filament, &thread, f);
    context.after_child_thread_finish(&thread);

    // Record the outcome before unbinding, which releases the joiner.
    let reraise = match guarded {
        Guarded::Outcome(outcome) => {
            filament.note_child_outcome(outcome);
            None
        }
        Guarded::Reraise(payload) => Some(payload),
    };
    binder.reset_current_filament();
    if let Some(payload) = reraise {
        std::panic::resume_unwind(payload);
    }
}
