//! 通用队列
//!
//! 调度器与信号量共用的唯一容器：节点存放在带空闲列表的仓（slab）中，
//! 以索引互相链接构成双向链表，支持 O(1) 的任意位置删除和遍历中安全删除

/// 队列操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// delete 没有找到匹配的元素
    NotFound,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::NotFound => write!(f, "element not found in queue"),
        }
    }
}

impl std::error::Error for QueueError {}

/// 遍历回调对当前元素的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterStep {
    /// 保留当前元素
    Keep,
    /// 删除当前元素（遍历继续，后继已提前记录）
    Remove,
}

/// 队列节点
///
/// prev/next 是指向仓内其他槽位的索引
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// 队列
///
/// 不变量：
/// - len 等于从 head 可达的节点数
/// - head 与 tail 同时为 None 当且仅当 len == 0
/// - 相邻节点的 prev/next 互相一致
pub struct Queue<T> {
    /// 节点仓，None 表示空闲槽位
    slots: Vec<Option<Node<T>>>,
    /// 空闲槽位索引栈，出队后的槽位在此复用
    free: Vec<usize>,
    /// 队头索引
    head: Option<usize>,
    /// 队尾索引
    tail: Option<usize>,
    /// 元素数量
    len: usize,
}

impl<T> Queue<T> {
    /// 创建空队列
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// 获取队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// 检查队列是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 在队尾追加元素，O(1)
    pub fn enqueue(&mut self, value: T) {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        match self.tail {
            Some(tail) => {
                if let Some(t) = self.slots[tail].as_mut() {
                    t.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// 移除并返回队头元素，O(1)；队列为空时返回 None
    pub fn dequeue(&mut self) -> Option<T> {
        let head = self.head?;
        self.unlink(head)
    }

    /// 删除第一个与 value 相等的元素
    ///
    /// 线性定位，定位后 O(1) 摘除。用于句柄类型时相等即身份相等，
    /// 不要依赖负载数据的结构化比较
    pub fn delete(&mut self, value: &T) -> Result<(), QueueError>
    where
        T: PartialEq,
    {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let (matched, next) = match self.slots[idx].as_ref() {
                Some(node) => (node.value == *value, node.next),
                None => break,
            };
            if matched {
                self.unlink(idx);
                return Ok(());
            }
            cur = next;
        }
        Err(QueueError::NotFound)
    }

    /// 从头到尾遍历队列
    ///
    /// 回调返回 IterStep::Remove 时摘除当前元素；后继索引在调用回调之前
    /// 已经记录，所以删除当前元素不影响遍历
    pub fn iterate<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut T) -> IterStep,
    {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let next = self.slots[idx].as_ref().and_then(|n| n.next);
            let step = match self.slots[idx].as_mut() {
                Some(node) => f(&mut node.value),
                None => IterStep::Keep,
            };
            if step == IterStep::Remove {
                self.unlink(idx);
            }
            cur = next;
        }
    }

    /// 摘除指定槽位的节点并返回其负载
    ///
    /// 统一处理队头、队尾、中间节点三种情况；摘除最后一个节点后
    /// head 与 tail 一并复位为 None
    fn unlink(&mut self, idx: usize) -> Option<T> {
        let node = self.slots.get_mut(idx)?.take()?;
        match node.prev {
            Some(prev) => {
                if let Some(p) = self.slots[prev].as_mut() {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.slots[next].as_mut() {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.len -= 1;
        self.free.push(idx);
        Some(node.value)
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        let mut cur = self.head;
        while let Some(idx) = cur {
            if let Some(node) = self.slots[idx].as_ref() {
                list.entry(&node.value);
                cur = node.next;
            } else {
                break;
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_dequeue_fifo() {
        let mut q = Queue::new();
        for i in 1..=5 {
            q.enqueue(i);
        }
        assert_eq!(q.len(), 5);
        for i in 1..=5 {
            assert_eq!(q.dequeue(), Some(i));
            assert_eq!(q.len(), 5 - i as usize);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_dequeue_empty() {
        let mut q: Queue<i32> = Queue::new();
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_delete_head_tail_interior() {
        let mut q = Queue::new();
        for i in 1..=5 {
            q.enqueue(i);
        }

        // 中间节点
        assert!(q.delete(&3).is_ok());
        // 队头
        assert!(q.delete(&1).is_ok());
        // 队尾
        assert!(q.delete(&5).is_ok());

        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(4));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_delete_absent_leaves_queue_unchanged() {
        let mut q = Queue::new();
        for i in 1..=3 {
            q.enqueue(i);
        }
        assert_eq!(q.delete(&42), Err(QueueError::NotFound));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
    }

    #[test]
    fn test_delete_first_match_only() {
        let mut q = Queue::new();
        q.enqueue(7);
        q.enqueue(8);
        q.enqueue(7);
        assert!(q.delete(&7).is_ok());
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(8));
        assert_eq!(q.dequeue(), Some(7));
    }

    #[test]
    fn test_delete_last_node_resets_queue() {
        let mut q = Queue::new();
        q.enqueue(1);
        assert!(q.delete(&1).is_ok());
        assert!(q.is_empty());
        // 复位后仍可正常使用
        q.enqueue(2);
        assert_eq!(q.dequeue(), Some(2));
    }

    #[test]
    fn test_iterate_delete_all() {
        let mut q = Queue::new();
        for i in 1..=5 {
            q.enqueue(i);
        }
        let mut visited = Vec::new();
        q.iterate(|v| {
            visited.push(*v);
            IterStep::Remove
        });
        assert_eq!(visited, vec![1, 2, 3, 4, 5]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_iterate_double_values() {
        let mut q = Queue::new();
        for i in 1..=5 {
            q.enqueue(i);
        }
        q.iterate(|v| {
            *v *= 2;
            IterStep::Keep
        });
        for i in 1..=5 {
            assert_eq!(q.dequeue(), Some(i * 2));
        }
    }

    #[test]
    fn test_iterate_delete_selected() {
        let mut q = Queue::new();
        for i in 1..=6 {
            q.enqueue(i);
        }
        // 删除偶数，其余保持原有顺序
        q.iterate(|v| {
            if *v % 2 == 0 {
                IterStep::Remove
            } else {
                IterStep::Keep
            }
        });
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), Some(5));
    }

    #[test]
    fn test_slot_reuse() {
        let mut q = Queue::new();
        for round in 0..3 {
            for i in 0..4 {
                q.enqueue(round * 10 + i);
            }
            for i in 0..4 {
                assert_eq!(q.dequeue(), Some(round * 10 + i));
            }
        }
        // 槽位反复复用后仓不应持续增长
        assert!(q.slots.len() <= 4);
    }
}
