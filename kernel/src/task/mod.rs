//! process management

pub mod lifecycle;
pub mod sched;
pub mod switch;

use crate::{
    arch::{
        boot::{boot_stack_top_addr, BOOT_STACK_SIZE},
        ints::InterruptRegisters,
        without_interrupts,
    },
    mm::{heap, PageDirectory},
};
use alloc::{boxed::Box, collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use common::{Errno, Result};
use core::fmt;
use spin::Mutex;

pub type Pid = usize;

/// the idle process, the one that runs when nothing else can
pub const IDLE_PID: Pid = 0;

/// init, the adoptive parent of every orphan
pub const INIT_PID: Pid = 1;

/// how many descriptor slots each process gets
pub const MAX_FILES: usize = 256;

/// how many children a process can have at once
pub const MAX_CHILDREN: usize = 64;

/// process names longer than this get truncated
pub const NAME_LEN: usize = 32;

/// how big each process's kernel stack is
pub const KERNEL_STACK_SIZE: usize = 0x4000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// allocated but not yet runnable
    Created,

    /// sitting in a scheduler queue
    Ready,

    /// owns the CPU right now
    Running,

    /// waiting on a child or a timeout, in no queue
    Blocked,

    /// exited, teardown still in progress
    Terminated,

    /// torn down, waiting for the parent to collect the exit code
    Zombie,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

/// what a descriptor ultimately points at; the console is the only backing
/// object this kernel has
#[derive(Debug)]
pub enum FileHandle {
    Console,
}

/// a slot in a process's descriptor table
///
/// duplicating (which fork does for every open slot) shares the underlying
/// handle and bumps its reference count; the handle goes away when the last
/// duplicate is closed
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub handle: Option<Arc<FileHandle>>,
    pub flags: u32,
    pub position: u64,
}

impl FileDescriptor {
    /// a descriptor on the console, what fds 0-2 start out as
    pub fn console() -> Self {
        Self {
            handle: Some(Arc::new(FileHandle::Console)),
            flags: 0,
            position: 0,
        }
    }

    /// a second descriptor on the same handle
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// how many descriptors share this handle
    pub fn ref_count(&self) -> usize {
        self.handle.as_ref().map(Arc::strong_count).unwrap_or(0)
    }
}

/// a process's kernel stack: separately allocated, 16 byte aligned
pub struct KernelStack {
    base: usize,
    size: usize,
    owned: bool,
}

impl KernelStack {
    /// carves a fresh stack out of the kernel heap
    pub fn allocate() -> Result<Self> {
        let base = heap::kmalloc(KERNEL_STACK_SIZE, 16).ok_or(Errno::OutOfMemory)? as usize;

        Ok(Self {
            base,
            size: KERNEL_STACK_SIZE,
            owned: true,
        })
    }

    /// wraps the boot stack; the idle process keeps running on it
    pub fn boot() -> Self {
        Self {
            base: boot_stack_top_addr() - BOOT_STACK_SIZE,
            size: BOOT_STACK_SIZE,
            owned: false,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// the address the stack grows down from
    pub fn top(&self) -> usize {
        self.base + self.size
    }

    /// whether the given address sits inside this stack
    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.base + self.size).contains(&addr)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        if self.owned {
            heap::kfree(self.base as *mut u8);
        }
    }
}

/// where the pieces of a user image ended up in an address space
#[derive(Debug, Copy, Clone)]
pub struct UserLayout {
    pub code_base: usize,
    pub code_pages: usize,
    pub data_base: usize,
    pub data_pages: usize,

    /// first address past the data, where a user heap would grow from
    pub heap_base: usize,

    pub stack_pages: usize,
}

/// an empty descriptor table
pub fn new_fd_table() -> Box<[Option<FileDescriptor>; MAX_FILES]> {
    let mut table = Vec::new();
    table.resize_with(MAX_FILES, || None);

    match table.into_boxed_slice().try_into() {
        Ok(table) => table,
        Err(_) => unreachable!(),
    }
}

/// a process control block
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub privilege: Privilege,

    /// the saved context this process resumes from
    pub registers: InterruptRegisters,

    pub page_directory: PageDirectory,
    pub kernel_stack: KernelStack,

    /// scheduler level, 0 (highest) through 4
    pub priority: usize,

    /// ticks left in the current quantum
    pub time_slice: u64,

    /// ticks spent ready without running, for aging
    pub wait_time: u64,

    /// ticks spent on the CPU, lifetime
    pub total_cpu_time: u64,

    /// jiffies value the last time this process was dispatched
    pub last_scheduled: u64,

    pub parent: Option<Pid>,
    pub exit_code: i32,

    pub files: Box<[Option<FileDescriptor>; MAX_FILES]>,
    pub children: Vec<Pid>,

    /// Some(0) = waiting for any child, Some(pid) = that one specifically
    pub waiting_for_child: Option<Pid>,

    /// where exec put the user image, if there is one
    pub user_layout: Option<UserLayout>,
}

impl Process {
    /// truncating name setter
    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(&name[..name.len().min(NAME_LEN)]);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("privilege", &self.privilege)
            .field("priority", &self.priority)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// every live PCB, keyed by pid; the single owner of all of them
pub struct ProcessTable {
    map: BTreeMap<Pid, Process>,
    next_pid: Pid,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            next_pid: 0,
        }
    }

    /// hands out the next pid; they only ever count up
    pub fn allocate_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    pub fn insert(&mut self, process: Process) {
        self.map.insert(process.pid, process);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.map.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.map.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.map.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.map.contains_key(&pid)
    }

    pub fn count(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> alloc::collections::btree_map::Iter<'_, Pid, Process> {
        self.map.iter()
    }
}

static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// runs a closure against the process table with interrupts off
pub fn with_process_table<T, F: FnOnce(&mut ProcessTable) -> T>(f: F) -> T {
    without_interrupts(|| f(&mut PROCESS_TABLE.lock()))
}

/// runs a closure against one process, if it exists
pub fn with_process<T, F: FnOnce(&mut Process) -> T>(pid: Pid, f: F) -> Option<T> {
    with_process_table(|table| table.get_mut(pid).map(f))
}

/// runs a closure against the process currently owning the CPU
pub fn with_current_process<T, F: FnOnce(&mut Process) -> T>(f: F) -> Option<T> {
    let pid = sched::current_pid()?;
    with_process(pid, f)
}

/// how many processes exist, in any state
pub fn process_count() -> usize {
    with_process_table(|table| table.count())
}

/// the idle loop: wait for interrupts forever. every interrupt that matters
/// drags the CPU into the scheduler on its way out
extern "C" fn idle_main() -> ! {
    loop {
        crate::arch::hlt();
    }
}

/// creates the idle process (pid 0); it runs on the boot stack, in the
/// kernel's own address space layout, and never sits in a queue
pub fn init() -> Result<()> {
    let page_directory = PageDirectory::new_process()?;

    with_process_table(|table| {
        let pid = table.allocate_pid();
        assert!(pid == IDLE_PID, "idle process has to be pid 0");

        let stack = KernelStack::boot();
        let registers = InterruptRegisters::new_kernel(idle_main as usize, stack.top());

        let mut idle = Process {
            pid,
            name: String::new(),
            state: ProcessState::Ready,
            privilege: Privilege::Kernel,
            registers,
            page_directory,
            kernel_stack: stack,
            priority: 0,
            time_slice: 0,
            wait_time: 0,
            total_cpu_time: 0,
            last_scheduled: 0,
            parent: None,
            exit_code: 0,
            files: new_fd_table(),
            children: Vec::new(),
            waiting_for_child: None,
            user_layout: None,
        };
        idle.set_name("idle");

        table.insert(idle);
    });

    Ok(())
}
