//! Threads and processes.
//!
//! ## The control-block model
//!
//! A process ([`Pcb`]) owns an address space and a set of threads; a thread
//! ([`Tcb`]) is the schedulable unit. Both live in the [`ControlBlocks`]
//! store, keyed by id.
//!
//! Every thread that has left [`ThreadState::New`] is on exactly one of the
//! global lists of [`ListId`]. The list is a function of the thread's state,
//! and [`ControlBlocks::alter_state`] is the only way to change either. It
//! takes an [`InterruptGuard`], so list surgery can not race with an
//! interrupt.
pub mod list;
pub mod scheduler;

use crate::{hv::GuestResource, mm::PageDir};
use alloc::{collections::BTreeMap, vec::Vec};
use bedrock::{
    addressing::Pa,
    interrupt::InterruptGuard,
    spin_lock::{SpinLock, SpinLockGuard, NO_HOLDER},
};
pub use list::ListId;
use list::ThreadLists;

/// Thread id.
pub type Tid = i32;
/// Process id: the tid of the process's first thread.
pub type Pid = i32;

/// Pid of the process created at boot.
pub const ROOT_PID: Pid = 0;

/// Why a waiting thread waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// Asleep until the tick count reaches `wake_tick`.
    Sleep { wake_tick: u32 },
    /// Waiting for keyboard input.
    ///
    /// The first reader owns input and waits for more of its line; the
    /// others wait for their turn.
    Readline { first_reader: bool },
    /// Descheduled until someone makes it runnable.
    Deschedule,
    /// Waiting for a child process to exit.
    VanishWait,
}

/// A possible state of the thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet on any list.
    New,
    /// Runnable.
    Ready,
    /// Running on the cpu.
    Running,
    /// Blocked.
    Waiting(BlockReason),
    /// Exited, waiting to be reaped.
    Terminated,
}

impl ThreadState {
    /// The list a thread in this state is on.
    pub const fn list(self) -> Option<ListId> {
        match self {
            Self::New => None,
            Self::Ready => Some(ListId::Ready),
            Self::Running => Some(ListId::Running),
            Self::Terminated => Some(ListId::Terminated),
            Self::Waiting(BlockReason::Sleep { .. }) => Some(ListId::Sleep),
            Self::Waiting(BlockReason::Readline { .. }) => Some(ListId::Readline),
            Self::Waiting(BlockReason::Deschedule) => Some(ListId::Deschedule),
            Self::Waiting(BlockReason::VanishWait) => Some(ListId::VanishWait),
        }
    }
}

/// A registered user exception handler.
///
/// Dispatching an exception to the handler consumes the registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionHandler {
    NoHandler,
    Armed {
        /// Top of the exception stack.
        esp3: u32,
        /// Entry point.
        eip: u32,
        /// Opaque argument.
        arg: u32,
    },
}

impl ExceptionHandler {
    /// Take the registration, leaving no handler behind.
    pub fn take(&mut self) -> Self {
        core::mem::replace(self, Self::NoHandler)
    }
}

/// Thread control block.
#[derive(Debug)]
pub struct Tcb {
    /// Thread id.
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    state: ThreadState,
    /// Saved kernel stack pointer. The frame the thread resumes with lies
    /// there while it is not running.
    pub esp: u32,
    /// Base of the kernel stack.
    pub kstack: Pa,
    /// User exception handler.
    pub handler: ExceptionHandler,
    /// Re-issue the interrupted system call when next run.
    pub restart: bool,
}

impl Tcb {
    /// Current state.
    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }
}

/// A range of pages handed out by `new_pages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub base: u32,
    pub len: u32,
}

/// Process state guarded by the process lock.
#[derive(Debug, Default)]
pub struct ProcessInner {
    /// Child processes not yet collected.
    pub children: Vec<Pid>,
    /// Threads not yet reaped.
    pub threads: Vec<Tid>,
    /// Exit status.
    pub status: i32,
}

/// Process control block.
pub struct Pcb {
    /// Process id.
    pub pid: Pid,
    /// Parent, if any.
    pub parent: Option<Pid>,
    /// Lock-protected part.
    pub inner: SpinLock<ProcessInner>,
    /// The address space.
    pub page_dir: PageDir,
    /// Ranges from `new_pages`.
    pub allocations: Vec<Allocation>,
    /// Virtual cpu state, if the process is a guest.
    pub guest: Option<GuestResource>,
}

impl Pcb {
    /// A process without threads.
    pub fn new(pid: Pid, parent: Option<Pid>, page_dir: PageDir) -> Self {
        Self {
            pid,
            parent,
            inner: SpinLock::new(ProcessInner::default()),
            page_dir,
            allocations: Vec::new(),
            guest: None,
        }
    }
}

/// The store of every control block.
pub struct ControlBlocks {
    slots: Vec<Option<Tcb>>,
    lists: ThreadLists,
    by_tid: BTreeMap<Tid, usize>,
    processes: BTreeMap<Pid, Pcb>,
    next_tid: Tid,
}

impl Default for ControlBlocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlocks {
    /// An empty store.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            lists: ThreadLists::new(),
            by_tid: BTreeMap::new(),
            processes: BTreeMap::new(),
            next_tid: 0,
        }
    }

    /// Hand out the next thread id.
    pub fn allocate_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn slot(&self, tid: Tid) -> usize {
        match self.by_tid.get(&tid) {
            Some(&slot) => slot,
            None => panic!("thread {} is not in the store", tid),
        }
    }

    fn tid_at(&self, slot: usize) -> Tid {
        match &self.slots[slot] {
            Some(tcb) => tcb.tid,
            None => panic!("thread list names an empty slot {}", slot),
        }
    }

    fn pid_at(&self, slot: usize) -> Pid {
        match &self.slots[slot] {
            Some(tcb) => tcb.pid,
            None => panic!("thread list names an empty slot {}", slot),
        }
    }

    /// Register a process.
    pub fn insert_process(&mut self, pcb: Pcb) {
        self.processes.insert(pcb.pid, pcb);
    }

    /// Create thread `tid` of process `pid` in [`ThreadState::New`].
    ///
    /// # Panics
    /// When `pid` is not registered.
    pub fn spawn(&mut self, tid: Tid, pid: Pid, kstack: Pa, esp: u32, handler: ExceptionHandler) {
        let tcb = Tcb {
            tid,
            pid,
            state: ThreadState::New,
            esp,
            kstack,
            handler,
            restart: false,
        };
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(tcb);
                slot
            }
            None => {
                self.slots.push(Some(tcb));
                self.slots.len() - 1
            }
        };
        self.by_tid.insert(tid, slot);
        match self.lock_process(pid) {
            Some(mut inner) => inner.threads.push(tid),
            None => panic!("spawn into unknown process {}", pid),
        }
    }

    /// Thread `tid`.
    pub fn tcb(&self, tid: Tid) -> Option<&Tcb> {
        self.by_tid
            .get(&tid)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Thread `tid`, mutably.
    pub fn tcb_mut(&mut self, tid: Tid) -> Option<&mut Tcb> {
        let slot = *self.by_tid.get(&tid)?;
        self.slots[slot].as_mut()
    }

    /// Process `pid`.
    pub fn pcb(&self, pid: Pid) -> Option<&Pcb> {
        self.processes.get(&pid)
    }

    /// Process `pid`, mutably.
    pub fn pcb_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.processes.get_mut(&pid)
    }

    /// Ids of every process.
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.processes.keys().copied()
    }

    /// Lock the mutable part of process `pid` on behalf of the running
    /// thread.
    pub fn lock_process(&self, pid: Pid) -> Option<SpinLockGuard<'_, ProcessInner>> {
        let holder = self.running().unwrap_or(NO_HOLDER);
        self.processes.get(&pid).map(|pcb| pcb.inner.lock_as(holder))
    }

    /// The running thread, if any.
    pub fn running(&self) -> Option<Tid> {
        self.lists
            .head(ListId::Running)
            .map(|slot| self.tid_at(slot))
    }

    /// The running thread.
    ///
    /// # Panics
    /// When nothing is running.
    pub fn current(&self) -> Tid {
        match self.lists.head(ListId::Running) {
            Some(slot) => self.tid_at(slot),
            None => panic!("no thread is running"),
        }
    }

    /// The running thread's control block.
    pub fn current_tcb(&self) -> &Tcb {
        let slot = self.slot(self.current());
        match &self.slots[slot] {
            Some(tcb) => tcb,
            None => unreachable!(),
        }
    }

    /// The running thread's control block, mutably.
    pub fn current_tcb_mut(&mut self) -> &mut Tcb {
        let slot = self.slot(self.current());
        match &mut self.slots[slot] {
            Some(tcb) => tcb,
            None => unreachable!(),
        }
    }

    /// The running thread's process.
    pub fn current_pcb(&self) -> &Pcb {
        let pid = self.current_tcb().pid;
        match self.processes.get(&pid) {
            Some(pcb) => pcb,
            None => panic!("running thread belongs to dead process {}", pid),
        }
    }

    /// The running thread's process, mutably.
    pub fn current_pcb_mut(&mut self) -> &mut Pcb {
        let pid = self.current_tcb().pid;
        match self.processes.get_mut(&pid) {
            Some(pcb) => pcb,
            None => panic!("running thread belongs to dead process {}", pid),
        }
    }

    /// First thread on `list`.
    pub fn head_of(&self, list: ListId) -> Option<Tid> {
        self.lists.head(list).map(|slot| self.tid_at(slot))
    }

    /// Threads on `list`, in list order.
    pub fn threads_in(&self, list: ListId) -> impl Iterator<Item = Tid> + '_ {
        self.lists.iter(list).map(move |slot| self.tid_at(slot))
    }

    /// Number of threads on `list`.
    pub fn count_in(&self, list: ListId) -> usize {
        self.lists.len(list)
    }

    /// Make `tid` the head of `list` without reordering it.
    pub fn rotate_to(&mut self, _guard: &InterruptGuard, list: ListId, tid: Tid) {
        let slot = self.slot(tid);
        self.lists.rotate_to(list, slot);
    }

    /// Move `tid` to state `to`, and to the list `to` names.
    ///
    /// Insertion points:
    /// - SLEEP stays sorted by wake tick, earlier sleepers first on ties.
    /// - READLINE puts the first reader in front, others at the back.
    /// - READY puts the thread after the last ready thread of its process,
    ///   or at the back.
    /// - RUNNING puts the thread in front.
    /// - Everything else goes to the back.
    ///
    /// # Panics
    /// When the thread is not on the list its state names, or when asked to
    /// go back to [`ThreadState::New`]. Both mean the store is corrupt.
    pub fn alter_state(&mut self, _guard: &InterruptGuard, tid: Tid, to: ThreadState) {
        let slot = self.slot(tid);
        let from = self.slots[slot].as_ref().map(Tcb::state);
        if let Some(list) = from.and_then(ThreadState::list) {
            if self.lists.list_of(slot) != Some(list) {
                panic!(
                    "thread {} in state {:?} is not found in {:?}",
                    tid, from, list
                );
            }
            self.lists.unlink(slot);
        }

        match to {
            ThreadState::New => panic!("thread {} can not become NEW again", tid),
            ThreadState::Running => self.lists.push_front(ListId::Running, slot),
            ThreadState::Ready => {
                let pid = self.pid_at(slot);
                let sibling = self
                    .lists
                    .iter(ListId::Ready)
                    .filter(|&s| self.pid_at(s) == pid)
                    .last();
                match sibling {
                    Some(at) => self.lists.insert_after(ListId::Ready, at, slot),
                    None => self.lists.push_back(ListId::Ready, slot),
                }
            }
            ThreadState::Waiting(BlockReason::Sleep { wake_tick }) => {
                let later = self.lists.iter(ListId::Sleep).find(|&s| {
                    matches!(
                        self.slots[s].as_ref().map(Tcb::state),
                        Some(ThreadState::Waiting(BlockReason::Sleep { wake_tick: w })) if w > wake_tick
                    )
                });
                match later {
                    Some(at) => self.lists.insert_before(ListId::Sleep, at, slot),
                    None => self.lists.push_back(ListId::Sleep, slot),
                }
            }
            ThreadState::Waiting(BlockReason::Readline { first_reader: true }) => {
                self.lists.push_front(ListId::Readline, slot)
            }
            other => match other.list() {
                Some(list) => self.lists.push_back(list, slot),
                None => unreachable!(),
            },
        }
        if let Some(tcb) = self.slots[slot].as_mut() {
            tcb.state = to;
        }
        debug_assert!(self.lists.len(ListId::Running) <= 1);
    }

    /// Threads of `pid` that have not terminated.
    ///
    /// Takes the process lock.
    pub fn alive_count(&self, pid: Pid) -> usize {
        let inner = match self.lock_process(pid) {
            Some(inner) => inner,
            None => return 0,
        };
        inner
            .threads
            .iter()
            .filter(|&&tid| {
                self.tcb(tid)
                    .map_or(false, |tcb| tcb.state != ThreadState::Terminated)
            })
            .count()
    }

    /// Threads of `pid` waiting for a child to exit.
    pub fn waiting_count(&self, pid: Pid) -> usize {
        self.threads_in(ListId::VanishWait)
            .filter(|&tid| self.tcb(tid).map_or(false, |tcb| tcb.pid == pid))
            .count()
    }

    /// A child of `pid` whose threads have all terminated.
    pub fn find_exited_child(&self, pid: Pid) -> Option<Pid> {
        let children = self.lock_process(pid)?.children.clone();
        children
            .into_iter()
            .find(|&child| self.alive_count(child) == 0)
    }

    /// Take `tid` off its list and out of the store and its process.
    pub fn remove_thread(&mut self, _guard: &InterruptGuard, tid: Tid) -> Option<Tcb> {
        let slot = self.by_tid.remove(&tid)?;
        self.lists.unlink(slot);
        let tcb = self.slots[slot].take()?;
        if let Some(mut inner) = self.lock_process(tcb.pid) {
            inner.threads.retain(|&t| t != tid);
        }
        Some(tcb)
    }

    /// Take process `pid` out of the store. Its threads must be gone.
    pub fn remove_process(&mut self, pid: Pid) -> Option<Pcb> {
        self.processes.remove(&pid)
    }
}
