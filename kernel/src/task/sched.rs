//! multi-level feedback queue scheduler
//!
//! five FIFO ready queues, 0 hottest. a process that burns through its whole
//! quantum drops a level; one that blocks first keeps its level; one that
//! sits ready long enough bubbles back up. the idle process lives outside
//! the queues and runs when they're all empty

use super::{switch, with_process, with_process_table, Pid, ProcessState, IDLE_PID};
use crate::arch::{ints::InterruptRegisters, without_interrupts};
use alloc::collections::VecDeque;
use spin::Mutex;

/// how many priority levels there are
pub const LEVELS: usize = 5;

/// time slices per level in timer ticks; 10 ms a tick at 100 Hz, so this is
/// 10/20/40/80/160 ms
pub const QUANTA: [u64; LEVELS] = [1, 2, 4, 8, 16];

/// ready ticks a process can accumulate before it gets pulled up a level
pub const AGING_THRESHOLD: u64 = 1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextSwitchMode {
    /// normal context switch, places the current task back onto the queue
    Normal,

    /// the current task blocked and doesn't go back on the queue
    Block,

    /// the current task is gone and obviously doesn't go back on the queue
    Remove,
}

struct Scheduler {
    /// the ready queues, one per level
    queues: [VecDeque<Pid>; LEVELS],

    /// who owns the CPU right now
    current: Option<Pid>,

    /// dispatch counts per level, for diagnostics
    runs_per_level: [u64; LEVELS],
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new()],
            current: None,
            runs_per_level: [0; LEVELS],
        }
    }

    /// pops the head of the first non-empty queue
    fn take_next(&mut self) -> Option<(Pid, usize)> {
        for level in 0..LEVELS {
            if let Some(pid) = self.queues[level].pop_front() {
                return Some((pid, level));
            }
        }

        None
    }

    /// the aging pass: every ready process below the top level accrues wait
    /// time, and anyone past the threshold moves up one level with a fresh
    /// slice. this is what keeps a starved process from waiting forever
    fn age_processes(&mut self) {
        for level in 1..LEVELS {
            let mut index = 0;

            while index < self.queues[level].len() {
                let pid = self.queues[level][index];

                let starved = with_process(pid, |p| {
                    p.wait_time += 1;
                    p.wait_time >= AGING_THRESHOLD
                })
                .unwrap_or(false);

                if starved {
                    self.queues[level].remove(index);

                    let new_level = level - 1;
                    with_process(pid, |p| {
                        p.priority = new_level;
                        p.time_slice = QUANTA[new_level];
                        p.wait_time = 0;
                    });

                    self.queues[new_level].push_back(pid);
                } else {
                    index += 1;
                }
            }
        }
    }

    fn remove_from_queues(&mut self, pid: Pid) {
        for queue in self.queues.iter_mut() {
            if let Some(index) = queue.iter().position(|p| *p == pid) {
                queue.remove(index);
            }
        }
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// the pid that owns the CPU right now
pub fn current_pid() -> Option<Pid> {
    without_interrupts(|| SCHEDULER.lock().current)
}

/// forces the current slot; scheduler start and tests only
pub(crate) fn set_current(pid: Option<Pid>) {
    without_interrupts(|| SCHEDULER.lock().current = pid);
}

/// makes a process ready at the given level: fresh slice, cleared wait time,
/// tail of the queue
pub fn enqueue_process(pid: Pid, level: usize) {
    let level = level.min(LEVELS - 1);

    with_process(pid, |p| {
        p.state = ProcessState::Ready;
        p.priority = level;
        p.time_slice = QUANTA[level];
        p.wait_time = 0;
    });

    without_interrupts(|| SCHEDULER.lock().queues[level].push_back(pid));
}

/// pulls a process out of whatever queue it's sitting in
pub(crate) fn remove_from_queues(pid: Pid) {
    without_interrupts(|| SCHEDULER.lock().remove_from_queues(pid));
}

/// promotes an interactive process straight to the top level
pub fn boost_interactive(pid: Pid) {
    without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.remove_from_queues(pid);

        let ready = with_process(pid, |p| {
            p.priority = 0;
            p.time_slice = QUANTA[0];
            p.wait_time = 0;
            p.state == ProcessState::Ready
        })
        .unwrap_or(false);

        if ready {
            sched.queues[0].push_back(pid);
        }
    });
}

/// the per-tick bookkeeping: aging, then charging the running process for
/// the tick. returns whether the tick path should follow up with a context
/// switch (slice ran out, or idle has work waiting)
pub(crate) fn tick_accounting() -> bool {
    without_interrupts(|| {
        let mut sched = SCHEDULER.lock();

        sched.age_processes();

        match sched.current {
            None => false,
            Some(IDLE_PID) => sched.queues.iter().any(|q| !q.is_empty()),
            Some(pid) => with_process(pid, |p| {
                p.total_cpu_time += 1;

                if p.time_slice > 0 {
                    p.time_slice -= 1;
                }

                if p.time_slice == 0 {
                    // slice used up: drop a level; the requeue on the way
                    // out of the switch lands at the new level's tail
                    p.priority = (p.priority + 1).min(LEVELS - 1);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false),
        }
    })
}

/// timer entry point; never preempts the kernel proper, only processes
pub fn on_tick(regs: &mut InterruptRegisters) {
    if !switch::in_task() {
        return;
    }

    if tick_accounting() {
        switch_context(regs, ContextSwitchMode::Normal);
    }
}

/// the context switch: saves the outgoing context per `mode`, picks the next
/// process (idle if the queues are dry), and resumes it. returns only when
/// the outgoing process gets to keep the CPU
pub fn switch_context(regs: &mut InterruptRegisters, mode: ContextSwitchMode) {
    let resume = without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let outgoing = sched.current;

        if let Some(pid) = outgoing {
            with_process(pid, |p| match mode {
                ContextSwitchMode::Normal | ContextSwitchMode::Block => {
                    p.registers = *regs;

                    if !p.registers.is_user() {
                        // a ring 0 context resumes on its own stack, right
                        // where the interrupt frame sits
                        p.registers.esp = regs.kernel_resume_esp();
                    }

                    if mode == ContextSwitchMode::Normal {
                        p.state = ProcessState::Ready;

                        if pid != IDLE_PID {
                            p.time_slice = QUANTA[p.priority];
                            p.wait_time = 0;
                        }
                    }
                }
                ContextSwitchMode::Remove => (),
            });

            if mode == ContextSwitchMode::Normal && pid != IDLE_PID {
                let level = with_process(pid, |p| p.priority).unwrap_or(LEVELS - 1);
                sched.queues[level].push_back(pid);
            }
        }

        let next = match sched.take_next() {
            Some((pid, level)) => {
                sched.runs_per_level[level] += 1;
                pid
            }
            None => IDLE_PID,
        };

        sched.current = Some(next);

        let resume = with_process(next, |p| {
            p.state = ProcessState::Running;
            p.wait_time = 0;
            p.last_scheduled = crate::timer::jiffies();

            (p.registers, p.kernel_stack.top(), p.page_directory.physical_addr())
        })
        .expect("a dead pid ended up in a run queue");

        if Some(next) == outgoing {
            // same process keeps going; the live frame is already correct
            None
        } else {
            Some(resume)
        }
    });

    if let Some((frame, stack_top, page_dir)) = resume {
        unsafe {
            switch::resume(frame, stack_top, page_dir);
        }
    }
}

/// turns the boot thread into the idle process and opens the floodgates;
/// the first timer tick takes it from here
pub fn start() -> ! {
    without_interrupts(|| {
        SCHEDULER.lock().current = Some(IDLE_PID);
        with_process(IDLE_PID, |p| p.state = ProcessState::Running);
    });

    switch::set_in_task(true);
    crate::arch::sti();

    loop {
        crate::arch::hlt();
    }
}

/// a snapshot of where every process stands, for diagnostics and tests
#[derive(Debug)]
pub struct SchedulerCensus {
    pub queue_sizes: [usize; LEVELS],
    pub current: Option<Pid>,
    pub runs_per_level: [u64; LEVELS],
    pub running: usize,
    pub ready: usize,
    pub blocked: usize,
    pub done: usize,
    pub total: usize,
}

pub fn census() -> SchedulerCensus {
    without_interrupts(|| {
        let sched = SCHEDULER.lock();

        let mut census = SchedulerCensus {
            queue_sizes: [0; LEVELS],
            current: sched.current,
            runs_per_level: sched.runs_per_level,
            running: 0,
            ready: 0,
            blocked: 0,
            done: 0,
            total: 0,
        };

        for (level, queue) in sched.queues.iter().enumerate() {
            census.queue_sizes[level] = queue.len();
        }

        with_process_table(|table| {
            for (_pid, process) in table.iter() {
                census.total += 1;

                match process.state {
                    ProcessState::Running => census.running += 1,
                    ProcessState::Ready => census.ready += 1,
                    ProcessState::Blocked => census.blocked += 1,
                    ProcessState::Terminated | ProcessState::Zombie => census.done += 1,
                    ProcessState::Created => (),
                }
            }
        });

        census
    })
}

/// which queue a pid is sitting in, if any
pub fn queue_level_of(pid: Pid) -> Option<usize> {
    without_interrupts(|| {
        let sched = SCHEDULER.lock();

        for (level, queue) in sched.queues.iter().enumerate() {
            if queue.iter().any(|p| *p == pid) {
                return Some(level);
            }
        }

        None
    })
}
