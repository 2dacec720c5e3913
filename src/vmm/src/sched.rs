//! Cooperative scheduling of guest processes.
//!
//! One vCPU, no preemption: a process runs until it traps into the host and a
//! bridge handler parks it or it exits. The scheduler's only job is picking
//! the next runnable process and policing the one invariant that matters: a
//! parked process must never be the only choice.

use std::collections::BTreeMap;

use tracing::debug;

use crate::process::{Pid, ProcState, Process, WaitReason};

pub struct Scheduler {
    procs: BTreeMap<Pid, Process>,
    current: Pid,
    next_pid: Pid,
}

impl Scheduler {
    pub fn new(init: Process) -> Scheduler {
        let current = init.pid;
        let next_pid = init.pid + 1;
        let mut procs = BTreeMap::new();
        procs.insert(init.pid, init);
        Scheduler {
            procs,
            current,
            next_pid,
        }
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn current(&self) -> &Process {
        &self.procs[&self.current]
    }

    pub fn current_mut(&mut self) -> &mut Process {
        self.procs
            .get_mut(&self.current)
            .expect("current process disappeared")
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    pub fn add(&mut self, proc: Process) {
        debug!("process {} spawned", proc.pid);
        self.procs.insert(proc.pid, proc);
    }

    pub fn any_runnable(&self) -> bool {
        self.procs
            .values()
            .any(|p| p.state == ProcState::Runnable)
    }

    /// Round-robin to the next runnable process.
    ///
    /// Coming back around to a still-waiting current process means its wait
    /// condition can never be satisfied; that is a guest-visible hang and the
    /// hypervisor refuses to spin on it.
    pub fn schedule(&mut self) -> Pid {
        let after: Vec<Pid> = self
            .procs
            .range(self.current + 1..)
            .chain(self.procs.range(..=self.current))
            .map(|(&pid, _)| pid)
            .collect();
        for pid in after {
            if self.procs[&pid].state == ProcState::Runnable {
                if pid != self.current {
                    debug!("switching {} -> {}", self.current, pid);
                }
                self.current = pid;
                return pid;
            }
        }
        match self.procs[&self.current].state {
            ProcState::Waiting(reason) => {
                panic!("deadlock: process {} parked on {reason:?} with nothing left to run", self.current)
            }
            _ => panic!("no runnable process left to schedule"),
        }
    }

    /// Retire the current process and deliver to a parent parked in wait4.
    /// The reaped child is dropped from the table; an unwaited child lingers
    /// as a zombie.
    pub fn exit_current(&mut self, status: i32) {
        let pid = self.current;
        let proc = self.current_mut();
        proc.state = ProcState::Exited(status);
        let parent = proc.parent;
        debug!("process {pid} exited with status {status}");

        // orphans are not reparented; nothing will reap them
        let children = std::mem::take(&mut self.current_mut().children);
        for child in children {
            if let Some(child) = self.procs.get_mut(&child) {
                child.parent = None;
            }
        }

        let Some(parent_pid) = parent else { return };
        let Some(parent) = self.procs.get_mut(&parent_pid) else {
            return;
        };
        if let ProcState::Waiting(WaitReason::Child { filter, status_ptr }) = parent.state {
            if filter == -1 || filter == pid as i64 {
                parent.state = ProcState::Runnable;
                parent.regs.rax = pid as u64;
                if status_ptr != 0 {
                    // standard exit-status encoding
                    let wstatus: i32 = (status & 0xff) << 8;
                    if let Err(err) = parent.vm.write_user_obj(status_ptr, wstatus) {
                        debug!("dropping wait4 status for {parent_pid}: {err}");
                    }
                }
                parent.children.retain(|&c| c != pid);
                if let Some(child) = self.procs.remove(&pid) {
                    child.vm.release();
                }
            }
        }
    }
}
