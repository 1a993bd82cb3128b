//! # Task Queue
//!
//! Partitions a disk image into owned offset ranges with overlapping read
//! windows, and hands them out to worker sessions on demand.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

/// One unit of scheduling.
///
/// `[start_offset, end_offset)` is the owned range; `[read_start, read_end)` is
/// what gets streamed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: u64,
    pub start_offset: u64,
    pub end_offset: u64,
    pub read_start: u64,
    pub read_end: u64,
}

impl Task {
    pub fn read_len(&self) -> u64 {
        self.read_end - self.read_start
    }

    pub fn owns(&self, offset: u64) -> bool {
        offset >= self.start_offset && offset < self.end_offset
    }
}

pub fn build_tasks(image_len: u64, task_chunk_size: u64, overlap: u64) -> Vec<Task> {
    if task_chunk_size == 0 {
        return Vec::new();
    }

    let half = overlap / 2;
    let mut tasks = Vec::new();
    let mut start = 0u64;
    let mut id = 0u64;

    while start < image_len {
        let end = start.saturating_add(task_chunk_size).min(image_len);
        let read_start = if start == 0 {
            0
        } else {
            start.saturating_sub(half)
        };
        let read_end = if end == image_len {
            image_len
        } else {
            end.saturating_add(half).min(image_len)
        };

        tasks.push(Task {
            id,
            start_offset: start,
            end_offset: end,
            read_start,
            read_end,
        });

        start = end;
        id += 1;
    }

    tasks
}

/// Shared FIFO of pending tasks.
///
/// Filled once before any worker connects; `pop` returning `None` is the
/// signal that scheduling is over.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn build(image_len: u64, task_chunk_size: u64, overlap: u64) -> Self {
        Self::from_tasks(build_tasks(image_len, task_chunk_size, overlap))
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let queue = Self {
            tasks: Mutex::new(VecDeque::new()),
        };
        for task in tasks {
            queue.push(task);
        }
        queue
    }

    /// Only called while the queue is being built; failed tasks are never
    /// pushed back.
    fn push(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
    }

    pub fn pop(&self) -> Option<Task> {
        self.tasks.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
