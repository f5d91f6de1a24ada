use std::collections::{HashMap, HashSet, VecDeque};

/// 有序通道表：同一 lane 同时只放行一个事件（处理中或等待重试），其余排队
#[derive(Debug)]
pub(crate) struct LaneTable<T> {
    busy: HashSet<String>,
    waiting: HashMap<String, VecDeque<T>>,
}

impl<T> Default for LaneTable<T> {
    fn default() -> Self {
        Self {
            busy: HashSet::new(),
            waiting: HashMap::new(),
        }
    }
}

impl<T> LaneTable<T> {
    /// 可立即执行时返回 `Some`，否则挂到该 lane 的等待队列
    pub(crate) fn admit(&mut self, lane: Option<&str>, item: T) -> Option<T> {
        let Some(lane) = lane else {
            return Some(item);
        };
        if self.busy.contains(lane) {
            self.waiting.entry(lane.to_string()).or_default().push_back(item);
            None
        } else {
            self.busy.insert(lane.to_string());
            Some(item)
        }
    }

    /// 释放 lane，返回同 lane 的下一个等待项（lane 继续保持占用）
    pub(crate) fn release(&mut self, lane: Option<&str>) -> Option<T> {
        let lane = lane?;
        if let Some(queue) = self.waiting.get_mut(lane) {
            if let Some(next) = queue.pop_front() {
                if queue.is_empty() {
                    self.waiting.remove(lane);
                }
                return Some(next);
            }
        }
        self.busy.remove(lane);
        None
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }

    /// 取出全部等待项（占用标记保留）
    pub(crate) fn drain_waiting(&mut self) -> Vec<T> {
        self.waiting
            .drain()
            .flat_map(|(_, queue)| queue.into_iter())
            .collect()
    }
}
