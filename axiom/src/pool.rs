/// Process pool — recycles `Process` allocations across `spawn`/death
/// cycles instead of allocating a fresh fiber (operand stack, frames,
/// gosub stack, try stack) every time a script spawns one. Mirrors
/// `Interpreter::update`'s periodic shrink check (every 300 ticks, once
/// the pool holds more than twice its floor).

use crate::process::Process;

pub const MIN_POOL_SIZE: usize = 16;
const SHRINK_INTERVAL_TICKS: u64 = 300;

pub struct ProcessPool {
    free: Vec<Process>,
    next_id: u32,
    ticks_since_shrink_check: u64,
}

impl ProcessPool {
    pub fn new() -> Self {
        let mut free = Vec::with_capacity(MIN_POOL_SIZE);
        for i in 0..MIN_POOL_SIZE {
            free.push(Process::new(i as u32));
        }
        ProcessPool { free, next_id: MIN_POOL_SIZE as u32, ticks_since_shrink_check: 0 }
    }

    /// Take a process off the free list, recycling its allocations, or
    /// build a brand new one if the pool is empty.
    pub fn acquire(&mut self) -> Process {
        match self.free.pop() {
            Some(mut p) => {
                let id = self.next_id;
                self.next_id += 1;
                p.reset_for_reuse(id);
                p
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                Process::new(id)
            }
        }
    }

    /// Return a dead process's allocations to the pool for reuse.
    pub fn release(&mut self, process: Process) {
        self.free.push(process);
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Called once per scheduler tick. Every `SHRINK_INTERVAL_TICKS`, if
    /// the free list has grown past twice the floor, trim it back down —
    /// a burst of spawns shouldn't pin that memory forever.
    pub fn on_tick(&mut self) {
        self.ticks_since_shrink_check += 1;
        if self.ticks_since_shrink_check < SHRINK_INTERVAL_TICKS {
            return;
        }
        self.ticks_since_shrink_check = 0;
        if self.free.len() > 2 * MIN_POOL_SIZE {
            self.free.truncate(MIN_POOL_SIZE);
        }
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_floor_sized_free_list() {
        let pool = ProcessPool::new();
        assert_eq!(pool.free_len(), MIN_POOL_SIZE);
    }

    #[test]
    fn acquire_drains_then_allocates_fresh() {
        let mut pool = ProcessPool::new();
        for _ in 0..MIN_POOL_SIZE {
            pool.acquire();
        }
        assert_eq!(pool.free_len(), 0);
        let p = pool.acquire();
        assert!(p.id >= MIN_POOL_SIZE as u32);
    }

    #[test]
    fn shrinks_back_to_floor_after_interval_once_oversized() {
        let mut pool = ProcessPool::new();
        let extra: Vec<Process> = (0..MIN_POOL_SIZE * 3).map(|i| Process::new(i as u32)).collect();
        for p in extra {
            pool.release(p);
        }
        assert!(pool.free_len() > 2 * MIN_POOL_SIZE);
        for _ in 0..SHRINK_INTERVAL_TICKS {
            pool.on_tick();
        }
        assert_eq!(pool.free_len(), MIN_POOL_SIZE);
    }

    #[test]
    fn shrink_does_not_fire_before_interval_elapses() {
        let mut pool = ProcessPool::new();
        let extra: Vec<Process> = (0..MIN_POOL_SIZE * 3).map(|i| Process::new(i as u32)).collect();
        for p in extra {
            pool.release(p);
        }
        for _ in 0..SHRINK_INTERVAL_TICKS - 1 {
            pool.on_tick();
        }
        assert!(pool.free_len() > MIN_POOL_SIZE);
    }
}
