// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Filaments and the registry that binds threads to them.
//!
//! A filament is the unit of reporting: the thread that invoked a routine
//! plus the child threads that routine started, and their children in turn.
//! Every thread of a filament reports to the same [`ExecutionContext`], and
//! the routine call does not return before all of them are done.

use crate::context::ExecutionContext;
use crate::context::ThreadIdentity;
use crate::event::MAX_STACK_FRAMES;
use crate::event::StackTrace;
use crate::guard::RoutineOutcome;
use bitfield_struct::bitfield;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Maximum number of child threads a filament tracks at once.
pub const MAX_CHILD_THREADS: usize = 64;

/// Maximum number of threads a [`ThreadBindings`] table holds.
pub const MAX_BOUND_THREADS: usize = 256;

/// Errors binding threads to filaments.
#[derive(Debug, Error)]
pub enum FilamentError {
    /// The calling thread has no filament.
    #[error("thread is not bound to a filament")]
    UnknownThread,
    /// The filament cannot track another child thread.
    #[error("filament already tracks {0} child threads")]
    ResourceExhausted(usize),
    /// The binding table is full.
    #[error("{0} threads already bound")]
    TooManyThreads(usize),
    /// The thread is already bound, or a default filament is already
    /// installed.
    #[error("conflicting filament binding")]
    Conflict,
    /// Child threads did not finish in time.
    #[error("child threads still running after {0:?}")]
    Timeout(Duration),
}

/// Filament properties.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FilamentFlags {
    /// Stands in for threads that were not started through the framework.
    pub is_default: bool,
    /// Attach stack traces to reported events.
    pub capture_stack_traces: bool,
    #[bits(30)]
    _reserved: u32,
}

/// Selects one of the per-filament value slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    /// Available to test code.
    Default,
    /// Reserved for the framework.
    Reserved,
}

impl ValueTag {
    fn index(self) -> usize {
        match self {
            ValueTag::Default => 0,
            ValueTag::Reserved => 1,
        }
    }
}

/// A routine thread and its children.
pub struct Filament {
    context: Arc<dyn ExecutionContext>,
    main_thread: ThreadId,
    flags: FilamentFlags,
    running_children: Mutex<usize>,
    children_done: Condvar,
    values: Mutex<[u64; 2]>,
    child_outcome: AtomicU8,
}

impl fmt::Debug for Filament {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filament")
            .field("main_thread", &self.main_thread)
            .field("flags", &self.flags)
            .field("running_children", &*self.running_children.lock())
            .finish()
    }
}

impl Filament {
    /// Creates a filament whose main thread is the calling thread.
    pub fn new(context: Arc<dyn ExecutionContext>, flags: FilamentFlags) -> Arc<Self> {
        Arc::new(Self {
            context,
            main_thread: std::thread::current().id(),
            flags,
            running_children: Mutex::new(0),
            children_done: Condvar::new(),
            values: Mutex::new([0; 2]),
            child_outcome: AtomicU8::new(RoutineOutcome::RanToCompletion as u8),
        })
    }

    /// The context all threads of this filament report to.
    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    /// The thread the filament was created on.
    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    /// The filament's properties.
    pub fn flags(&self) -> FilamentFlags {
        self.flags
    }

    /// The identity `thread` reports with.
    pub fn identity(&self, thread: ThreadId) -> ThreadIdentity {
        ThreadIdentity {
            main_thread: self.main_thread,
            thread,
        }
    }

    /// Captures the calling thread's stack if this filament wants stack
    /// traces.
    pub fn capture_stack_trace(&self) -> Option<StackTrace> {
        self.flags
            .capture_stack_traces()
            .then(|| StackTrace::capture(MAX_STACK_FRAMES))
    }

    /// Reads a value slot.
    pub fn get_value(&self, tag: ValueTag) -> u64 {
        self.values.lock()[tag.index()]
    }

    /// Writes a value slot.
    pub fn set_value(&self, tag: ValueTag, value: u64) {
        self.values.lock()[tag.index()] = value;
    }

    /// Number of child threads that have not finished yet.
    pub fn running_child_threads(&self) -> usize {
        *self.running_children.lock()
    }

    fn register_child(self: &Arc<Self>) -> Result<ChildSlot, FilamentError> {
        let mut running = self.running_children.lock();
        if *running >= MAX_CHILD_THREADS {
            return Err(FilamentError::ResourceExhausted(*running));
        }
        *running += 1;
        Ok(ChildSlot {
            filament: self.clone(),
        })
    }

    /// Waits until no child thread is running, or `timeout` elapsed.
    ///
    /// Children bind before their parent may finish, so threads started by
    /// other children while waiting are waited for as well.
    pub fn join_child_threads(&self, timeout: Duration) -> Result<(), FilamentError> {
        let deadline = Instant::now() + timeout;
        let mut running = self.running_children.lock();
        while *running != 0 {
            if self
                .children_done
                .wait_until(&mut running, deadline)
                .timed_out()
                && *running != 0
            {
                return Err(FilamentError::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Folds the outcome of a finished child thread into the filament.
    pub(crate) fn note_child_outcome(&self, outcome: RoutineOutcome) {
        self.child_outcome
            .fetch_max(outcome as u8, Ordering::SeqCst);
    }

    /// The worst outcome reported by any child thread so far.
    pub(crate) fn child_outcome(&self) -> RoutineOutcome {
        RoutineOutcome::from_raw(self.child_outcome.load(Ordering::SeqCst))
    }
}

/// A running child thread, counted by its filament until dropped.
struct ChildSlot {
    filament: Arc<Filament>,
}

impl Drop for ChildSlot {
    fn drop(&mut self) {
        let mut running = self.filament.running_children.lock();
        *running -= 1;
        if *running == 0 {
            self.filament.children_done.notify_all();
        }
    }
}

/// The filament binding of the calling thread.
#[derive(Debug, Clone)]
pub struct CurrentThread {
    /// The filament the thread belongs to.
    pub filament: Arc<Filament>,
    /// The identity the thread reports with.
    pub identity: ThreadIdentity,
    /// False for threads that were attached to the default filament on
    /// first use. Failures on such threads terminate the thread instead of
    /// unwinding to a routine boundary.
    pub guarded: bool,
}

/// Membership of one thread in a filament.
///
/// Created and dropped outside of the registry lock: creating one counts a
/// child thread in its filament, dropping one releases it.
pub struct Binding {
    thread: ThreadId,
    filament: Arc<Filament>,
    _child: Option<ChildSlot>,
    guarded: bool,
}

impl Binding {
    /// Prepares a binding of `thread` to `filament`. Threads other than the
    /// filament's main thread count as its children while bound.
    pub fn new(
        thread: ThreadId,
        filament: &Arc<Filament>,
        guarded: bool,
    ) -> Result<Self, FilamentError> {
        let child = if thread != filament.main_thread {
            Some(filament.register_child()?)
        } else {
            None
        };
        Ok(Self {
            thread,
            filament: filament.clone(),
            _child: child,
            guarded,
        })
    }

    fn current(&self) -> CurrentThread {
        CurrentThread {
            filament: self.filament.clone(),
            identity: self.filament.identity(self.thread),
            guarded: self.guarded,
        }
    }

    fn is_for(&self, filament: &Filament) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.filament), filament)
    }
}

/// A binding the table refused. Drop it once the table's lock is released.
pub struct BindError {
    /// Why the binding was refused.
    pub error: FilamentError,
    /// The refused binding.
    pub binding: Binding,
}

/// Thread to filament bindings.
///
/// Holds no lock of its own; each registry wraps it in the lock that suits
/// its environment. Storage is allocated up front, and bindings leave the
/// table by value, so nothing under the lock allocates or blocks.
pub struct ThreadBindings {
    bindings: Vec<Binding>,
}

impl Default for ThreadBindings {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadBindings {
    /// An empty table with room for [`MAX_BOUND_THREADS`] threads.
    pub fn new() -> Self {
        Self {
            bindings: Vec::with_capacity(MAX_BOUND_THREADS),
        }
    }

    fn position(&self, thread: ThreadId) -> Option<usize> {
        self.bindings
            .iter()
            .position(|binding| binding.thread == thread)
    }

    /// Adds `binding`. Fails if its thread is already bound or the table is
    /// full.
    pub fn bind(&mut self, binding: Binding) -> Result<(), BindError> {
        let error = if self.position(binding.thread).is_some() {
            FilamentError::Conflict
        } else if self.bindings.len() >= MAX_BOUND_THREADS {
            FilamentError::TooManyThreads(self.bindings.len())
        } else {
            self.bindings.push(binding);
            return Ok(());
        };
        Err(BindError { error, binding })
    }

    /// The binding of `thread`, if any.
    pub fn lookup(&self, thread: ThreadId) -> Option<CurrentThread> {
        self.position(thread)
            .map(|index| self.bindings[index].current())
    }

    /// Returns true if `thread` is bound to `filament`.
    pub fn is_bound_to(&self, thread: ThreadId, filament: &Filament) -> bool {
        self.position(thread)
            .is_some_and(|index| self.bindings[index].is_for(filament))
    }

    /// Removes the binding of `thread`.
    #[must_use]
    pub fn unbind(&mut self, thread: ThreadId) -> Option<Binding> {
        let index = self.position(thread)?;
        Some(self.bindings.swap_remove(index))
    }

    /// Removes the binding of `thread` only if it is bound to `filament`.
    #[must_use]
    pub fn unbind_if(&mut self, thread: ThreadId, filament: &Filament) -> Option<Binding> {
        if self.is_bound_to(thread, filament) {
            self.unbind(thread)
        } else {
            None
        }
    }

    /// Removes every binding to `filament`.
    #[must_use]
    pub fn unbind_filament(&mut self, filament: &Filament) -> Vec<Binding> {
        self.bindings
            .extract_if(.., |binding| binding.is_for(filament))
            .collect()
    }

    /// Number of bound threads.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if no thread is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// What reporting primitives do when the calling thread has no filament.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnknownThreadPolicy {
    /// Terminate the thread.
    Terminate,
    /// Log and carry on.
    Ignore,
}

/// Binds threads to filaments.
pub trait FilamentBinder: Send + Sync {
    /// Binds the calling thread to `filament`.
    fn set_current_filament(&self, filament: &Arc<Filament>) -> Result<(), FilamentError>;

    /// The binding of the calling thread. With `derive_default`, an unbound
    /// thread may be attached to a default filament instead of failing.
    fn get_current(&self, derive_default: bool) -> Result<CurrentThread, FilamentError>;

    /// Unbinds the calling thread. Does nothing if it is not bound.
    fn reset_current_filament(&self);

    /// How reports from threads without a filament are handled.
    fn unknown_thread_policy(&self) -> UnknownThreadPolicy;

    /// The filament of the calling thread.
    fn get_current_filament(&self, derive_default: bool) -> Result<Arc<Filament>, FilamentError> {
        Ok(self.get_current(derive_default)?.filament)
    }
}

#[derive(Default)]
struct RegistryState {
    bindings: ThreadBindings,
    default_filament: Option<Arc<Filament>>,
}

/// User-mode filament registry.
#[derive(Clone, Default)]
pub struct FilamentRegistry {
    state: Arc<Mutex<RegistryState>>,
}

static GLOBAL_REGISTRY: LazyLock<FilamentRegistry> = LazyLock::new(FilamentRegistry::new);

struct AutoRegistration {
    state: Weak<Mutex<RegistryState>>,
    thread: ThreadId,
    filament: Weak<Filament>,
}

impl AutoRegistration {
    /// The binding is gone, because its filament was revoked or its
    /// registry dropped.
    fn is_stale(&self) -> bool {
        match (self.state.upgrade(), self.filament.upgrade()) {
            (Some(state), Some(filament)) => {
                !state.lock().bindings.is_bound_to(self.thread, &filament)
            }
            _ => true,
        }
    }
}

impl Drop for AutoRegistration {
    fn drop(&mut self) {
        if let (Some(state), Some(filament)) = (self.state.upgrade(), self.filament.upgrade()) {
            let released = state.lock().bindings.unbind_if(self.thread, &filament);
            drop(released);
        }
    }
}

thread_local! {
    // Bindings made on first use, released when the thread exits.
    static AUTO_REGISTRATIONS: RefCell<Vec<AutoRegistration>> = const { RefCell::new(Vec::new()) };
}

impl FilamentRegistry {
    /// An empty registry without a default filament.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by the reporting macros.
    pub fn global() -> &'static Self {
        &GLOBAL_REGISTRY
    }

    /// Installs a default filament that threads nobody bound are attached
    /// to on their first report. The filament's main thread is the calling
    /// thread.
    ///
    /// Only one default filament may be installed at a time.
    pub fn install_default_filament(
        &self,
        context: Arc<dyn ExecutionContext>,
        flags: FilamentFlags,
    ) -> Result<DefaultFilament, FilamentError> {
        let mut state = self.state.lock();
        if state.default_filament.is_some() {
            return Err(FilamentError::Conflict);
        }
        let filament = Filament::new(context, flags.with_is_default(true));
        state.default_filament = Some(filament.clone());
        Ok(DefaultFilament {
            registry: self.clone(),
            filament,
        })
    }

    /// The installed default filament, if any.
    pub fn default_filament(&self) -> Option<Arc<Filament>> {
        self.state.lock().default_filament.clone()
    }

    /// Number of bound threads.
    pub fn bound_threads(&self) -> usize {
        self.state.lock().bindings.len()
    }

    fn auto_register(&self, thread: ThreadId) -> Result<CurrentThread, FilamentError> {
        let filament = self.default_filament().ok_or(FilamentError::UnknownThread)?;
        let binding = Binding::new(thread, &filament, false)?;
        let bound = {
            let mut state = self.state.lock();
            // The default filament may have been revoked in the meantime.
            let installed = state
                .default_filament
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &filament));
            if installed {
                state.bindings.bind(binding).map_err(|rejected| rejected.error)
            } else {
                Err(FilamentError::UnknownThread)
            }
        };
        bound?;

        let registration = AutoRegistration {
            state: Arc::downgrade(&self.state),
            thread,
            filament: Arc::downgrade(&filament),
        };
        let pushed = AUTO_REGISTRATIONS.try_with(|registrations| {
            let mut registrations = registrations.borrow_mut();
            registrations.retain(|registration| !registration.is_stale());
            registrations.push(registration);
        });
        if pushed.is_err() {
            // The thread is exiting, so nothing would release the binding.
            let released = self.state.lock().bindings.unbind_if(thread, &filament);
            drop(released);
            return Err(FilamentError::UnknownThread);
        }

        tracing::debug!(?thread, "attached thread to default filament");
        Ok(CurrentThread {
            identity: filament.identity(thread),
            filament,
            guarded: false,
        })
    }

    #[cfg(test)]
    fn auto_registrations() -> usize {
        AUTO_REGISTRATIONS.with(|registrations| registrations.borrow().len())
    }
}

impl FilamentBinder for FilamentRegistry {
    fn set_current_filament(&self, filament: &Arc<Filament>) -> Result<(), FilamentError> {
        let binding = Binding::new(std::thread::current().id(), filament, true)?;
        let bound = self.state.lock().bindings.bind(binding);
        bound.map_err(|rejected| rejected.error)
    }

    fn get_current(&self, derive_default: bool) -> Result<CurrentThread, FilamentError> {
        let thread = std::thread::current().id();
        if let Some(current) = self.state.lock().bindings.lookup(thread) {
            return Ok(current);
        }
        if derive_default {
            self.auto_register(thread)
        } else {
            Err(FilamentError::UnknownThread)
        }
    }

    fn reset_current_filament(&self) {
        let released = self
            .state
            .lock()
            .bindings
            .unbind(std::thread::current().id());
        drop(released);
    }

    fn unknown_thread_policy(&self) -> UnknownThreadPolicy {
        UnknownThreadPolicy::Terminate
    }
}

/// An installed default filament. Dropping it revokes the filament and
/// unbinds the threads attached to it.
#[must_use]
pub struct DefaultFilament {
    registry: FilamentRegistry,
    filament: Arc<Filament>,
}

impl DefaultFilament {
    /// The installed filament.
    pub fn filament(&self) -> &Arc<Filament> {
        &self.filament
    }
}

impl Drop for DefaultFilament {
    fn drop(&mut self) {
        let released = {
            let mut state = self.registry.state.lock();
            if state
                .default_filament
                .as_ref()
                .is_some_and(|filament| Arc::ptr_eq(filament, &self.filament))
            {
                state.default_filament = None;
            }
            state.bindings.unbind_filament(&self.filament)
        };
        drop(released);
    }
}
