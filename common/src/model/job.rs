use crate::model::inspect::InspectLink;
use crate::model::item::ItemData;
use errors::ErrorCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct JobLink {
    pub link: InspectLink,
    pub price: Option<i64>,
}

/// 单个槽位的最终结果
#[derive(Debug, Clone)]
pub enum SlotOutcome {
    Item(Box<ItemData>),
    Failed(ErrorCode),
}

/// 一次客户端提交的批量请求
///
/// 每个链接占一个槽位，全部槽位被写入后任务完成。
pub struct Job {
    pub client: String,
    pub bulk: bool,
    pub links: Vec<JobLink>,
    slots: Mutex<Vec<Option<SlotOutcome>>>,
    unresolved: AtomicUsize,
    done: Notify,
}

impl Job {
    pub fn new(client: impl Into<String>, bulk: bool, links: Vec<JobLink>) -> Self {
        let n = links.len();
        Job {
            client: client.into(),
            bulk,
            links,
            slots: Mutex::new(vec![None; n]),
            unresolved: AtomicUsize::new(n),
            done: Notify::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.unresolved.load(Ordering::SeqCst)
    }

    /// 未写入槽位的链接及其下标
    pub fn remaining_links(&self) -> Vec<(usize, JobLink)> {
        let slots = self.slots.lock().unwrap();
        self.links
            .iter()
            .enumerate()
            .filter(|(i, _)| slots[*i].is_none())
            .map(|(i, l)| (i, l.clone()))
            .collect()
    }

    /// 写入槽位；只有第一次写入生效
    pub fn resolve(&self, slot: usize, outcome: SlotOutcome) {
        let mut slots = self.slots.lock().unwrap();
        if slot >= slots.len() || slots[slot].is_some() {
            return;
        }
        slots[slot] = Some(outcome);
        drop(slots);
        if self.unresolved.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done.notify_waiters();
        }
    }

    /// 等待所有槽位完成
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// 完成后按槽位顺序取结果；未写入的槽位视为通用失败
    pub fn outcomes(&self) -> Vec<SlotOutcome> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .map(|s| s.clone().unwrap_or(SlotOutcome::Failed(ErrorCode::GenericBad)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(a: &str) -> JobLink {
        JobLink {
            link: InspectLink::from_parts(Some("9"), Some(a), Some("2"), None).unwrap(),
            price: None,
        }
    }

    #[tokio::test]
    async fn test_job_completes_when_all_slots_resolve() {
        let job = Job::new("1.2.3.4", true, vec![link("1"), link("2")]);
        assert_eq!(job.remaining(), 2);
        job.resolve(0, SlotOutcome::Failed(ErrorCode::TtlExceeded));
        assert_eq!(job.remaining(), 1);
        job.resolve(1, SlotOutcome::Failed(ErrorCode::TtlExceeded));
        job.wait().await;
        assert_eq!(job.outcomes().len(), 2);
    }

    #[tokio::test]
    async fn test_double_resolve_is_ignored() {
        let job = Job::new("1.2.3.4", false, vec![link("1")]);
        job.resolve(0, SlotOutcome::Failed(ErrorCode::TtlExceeded));
        job.resolve(0, SlotOutcome::Failed(ErrorCode::GenericBad));
        match &job.outcomes()[0] {
            SlotOutcome::Failed(code) => assert_eq!(*code, ErrorCode::TtlExceeded),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn test_remaining_links() {
        let job = Job::new("1.2.3.4", true, vec![link("1"), link("2")]);
        job.resolve(0, SlotOutcome::Failed(ErrorCode::TtlExceeded));
        let rest = job.remaining_links();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, 1);
        assert_eq!(rest[0].1.link.a, "2");
    }
}
