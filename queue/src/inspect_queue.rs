use async_trait::async_trait;
use common::model::inspect::InspectLink;
use common::model::job::{Job, SlotOutcome};
use errors::{ErrorCode, Result};
use log::{debug, warn};
use metrics::{counter, gauge};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

/// 当下无会话可用时稍等再重新入队，避免空转
const NO_SESSION_BACKOFF: Duration = Duration::from_millis(50);

/// 从任务里拆出的单个链接
pub struct QueueEntry {
    pub link: InspectLink,
    pub price: Option<i64>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub client: String,
    pub job: Arc<Job>,
    pub slot: usize,
}

/// 出队处理器；成功时返回本会话的发包间隔
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, entry: &QueueEntry) -> Result<Duration>;
}

/// 出队前的入场闸门，由代理池实现
pub trait CapacityGate: Send + Sync {
    fn can_accept(&self) -> bool;
}

struct QueueInner {
    queue: VecDeque<QueueEntry>,
    users: HashMap<String, usize>,
    processing: usize,
    concurrency: usize,
    running: bool,
}

/// 检视请求队列
///
/// 首次入队按 FIFO；重试插队到队首。并发上限跟随就绪会话数，
/// 由外部定时调 resize。
pub struct InspectQueue {
    weak: Weak<InspectQueue>,
    inner: Mutex<QueueInner>,
    notify: Notify,
    handler: Arc<dyn QueueHandler>,
    gate: Option<Arc<dyn CapacityGate>>,
    max_attempts: u32,
}

impl InspectQueue {
    pub fn new(
        handler: Arc<dyn QueueHandler>,
        gate: Option<Arc<dyn CapacityGate>>,
        max_attempts: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| InspectQueue {
            weak: weak.clone(),
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                users: HashMap::new(),
                processing: 0,
                concurrency: 0,
                running: false,
            }),
            notify: Notify::new(),
            handler,
            gate,
            max_attempts,
        })
    }

    pub fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        {
            self.inner.lock().unwrap().running = true;
        }
        let Some(queue) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                queue.drain();
                tokio::select! {
                    _ = shutdown.recv() => {
                        queue.inner.lock().unwrap().running = false;
                        break;
                    }
                    _ = queue.notify.notified() => {}
                }
            }
            debug!("Inspect queue drain loop stopped");
        });
    }

    /// 任务的每个未完成链接入队一条；同时抬高该客户端的计数
    pub fn add_job(&self, job: &Arc<Job>) {
        for (slot, job_link) in job.remaining_links() {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.push_back(QueueEntry {
                link: job_link.link,
                price: job_link.price,
                attempts: 0,
                max_attempts: self.max_attempts,
                client: job.client.clone(),
                job: job.clone(),
                slot,
            });
            *inner.users.entry(job.client.clone()).or_insert(0) += 1;
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn user_load(&self, client: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(client)
            .copied()
            .unwrap_or(0)
    }

    pub fn concurrency(&self) -> usize {
        self.inner.lock().unwrap().concurrency
    }

    pub fn processing(&self) -> usize {
        self.inner.lock().unwrap().processing
    }

    /// 由定时器按就绪会话数调整并发上限，变大时踢一脚排水循环
    pub fn resize(&self, target: usize) {
        let grew = {
            let mut inner = self.inner.lock().unwrap();
            let grew = target > inner.concurrency;
            inner.concurrency = target;
            grew
        };
        if grew {
            self.notify.notify_one();
        }
    }

    fn drain(&self) {
        let Some(queue) = self.weak.upgrade() else {
            return;
        };
        loop {
            let entry = {
                let mut inner = self.inner.lock().unwrap();
                if !inner.running
                    || inner.queue.is_empty()
                    || inner.processing >= inner.concurrency
                {
                    break;
                }
                if let Some(gate) = &self.gate
                    && !gate.can_accept()
                {
                    break;
                }
                inner.processing += 1;
                inner.queue.pop_front().unwrap()
            };
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.run_entry(entry).await;
            });
        }
        gauge!("queue_depth").set(self.size() as f64);
    }

    async fn run_entry(self: Arc<Self>, mut entry: QueueEntry) {
        match self.handler.handle(&entry).await {
            Ok(delay) => {
                counter!("queue_entries_resolved_total").increment(1);
                {
                    let mut inner = self.inner.lock().unwrap();
                    decrement_user(&mut inner.users, &entry.client);
                }
                // 尊重会话的发包间隔后再释放并发额度
                tokio::time::sleep(delay).await;
                self.inner.lock().unwrap().processing -= 1;
                self.notify.notify_one();
            }
            Err(e) if e.is_no_session() => {
                counter!("queue_no_session_total").increment(1);
                tokio::time::sleep(NO_SESSION_BACKOFF).await;
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.queue.push_front(entry);
                    inner.processing -= 1;
                }
                self.notify.notify_one();
            }
            Err(e) => {
                entry.attempts += 1;
                if entry.attempts >= entry.max_attempts {
                    warn!(
                        "Entry for asset {} failed terminally after {} attempts: {}",
                        entry.link.a, entry.attempts, e
                    );
                    counter!("queue_entries_failed_total").increment(1);
                    entry
                        .job
                        .resolve(entry.slot, SlotOutcome::Failed(ErrorCode::TtlExceeded));
                    let mut inner = self.inner.lock().unwrap();
                    decrement_user(&mut inner.users, &entry.client);
                    inner.processing -= 1;
                } else {
                    debug!(
                        "Entry for asset {} failed (attempt {}), requeued at head: {}",
                        entry.link.a, entry.attempts, e
                    );
                    let mut inner = self.inner.lock().unwrap();
                    inner.queue.push_front(entry);
                    inner.processing -= 1;
                }
                self.notify.notify_one();
            }
        }
    }
}

fn decrement_user(users: &mut HashMap<String, usize>, client: &str) {
    if let Some(count) = users.get_mut(client) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            users.remove(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::item::{ItemData, RawItem};
    use common::model::job::JobLink;
    use errors::SessionError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(client: &str, assets: &[&str]) -> Arc<Job> {
        let links = assets
            .iter()
            .map(|a| JobLink {
                link: InspectLink::from_parts(Some("7"), Some(a), Some("2"), None).unwrap(),
                price: None,
            })
            .collect();
        Arc::new(Job::new(client, assets.len() > 1, links))
    }

    /// 按脚本执行的处理器，记录 (asset, attempts) 调用序列
    struct ScriptedHandler {
        script: Mutex<VecDeque<std::result::Result<u64, &'static str>>>,
        seen: Mutex<Vec<(String, u32)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(script: Vec<std::result::Result<u64, &'static str>>) -> Arc<Self> {
            Arc::new(ScriptedHandler {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn seen(&self) -> Vec<(String, u32)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueueHandler for ScriptedHandler {
        async fn handle(&self, entry: &QueueEntry) -> Result<Duration> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((entry.link.a.clone(), entry.attempts));
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Ok(delay_ms)) => {
                    // 真实的出队处理器在成功时写槽位
                    let item = ItemData::from(RawItem {
                        itemid: entry.link.a.parse().unwrap_or(0),
                        ..Default::default()
                    });
                    entry.job.resolve(entry.slot, SlotOutcome::Item(Box::new(item)));
                    Ok(Duration::from_millis(delay_ms))
                }
                Some(Err("no_session")) => Err(errors::Error::no_session_available()),
                Some(Err(_)) | None => Err(SessionError::TtlExceeded.into()),
            }
        }
    }

    async fn settle(queue: &Arc<InspectQueue>, job: &Arc<Job>) {
        tokio::time::timeout(Duration::from_secs(2), job.wait())
            .await
            .expect("job did not settle");
        // 留点时间让 processing 归零
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.processing(), 0);
    }

    #[tokio::test]
    async fn test_fifo_and_success() {
        let handler = ScriptedHandler::new(vec![Ok(0), Ok(0)]);
        let queue = InspectQueue::new(handler.clone(), None, 3);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);
        queue.resize(1);

        let job = job("1.1.1.1", &["10", "11"]);
        queue.add_job(&job);
        settle(&queue, &job).await;

        let seen = handler.seen();
        assert_eq!(seen, vec![("10".to_string(), 0), ("11".to_string(), 0)]);
        assert_eq!(queue.user_load("1.1.1.1"), 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_transient_retry_jumps_queue() {
        // X 失败一次后重试插队，Y 只能排在 X 的重试之后
        let handler = ScriptedHandler::new(vec![Err("boom"), Ok(0), Ok(0)]);
        let queue = InspectQueue::new(handler.clone(), None, 3);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);
        queue.resize(1);

        let job = job("1.1.1.1", &["10", "11"]);
        queue.add_job(&job);
        settle(&queue, &job).await;

        let seen = handler.seen();
        assert_eq!(
            seen,
            vec![
                ("10".to_string(), 0),
                ("10".to_string(), 1),
                ("11".to_string(), 0)
            ]
        );
        drop(tx);
    }

    #[tokio::test]
    async fn test_no_session_does_not_count_attempt() {
        let handler = ScriptedHandler::new(vec![Err("no_session"), Ok(0)]);
        let queue = InspectQueue::new(handler.clone(), None, 1);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);
        queue.resize(1);

        let job = job("1.1.1.1", &["10"]);
        queue.add_job(&job);
        settle(&queue, &job).await;

        let seen = handler.seen();
        // max_attempts=1 也没有终止：NoBotsAvailable 不计数
        assert_eq!(seen, vec![("10".to_string(), 0), ("10".to_string(), 0)]);
        match &job.outcomes()[0] {
            SlotOutcome::Item(item) => assert_eq!(item.itemid, 10),
            SlotOutcome::Failed(_) => panic!("job must not fail"),
        }
        drop(tx);
    }

    #[tokio::test]
    async fn test_max_attempts_terminal() {
        let handler = ScriptedHandler::new(vec![Err("a"), Err("b")]);
        let queue = InspectQueue::new(handler.clone(), None, 2);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);
        queue.resize(1);

        let job = job("1.1.1.1", &["10"]);
        queue.add_job(&job);
        assert_eq!(queue.user_load("1.1.1.1"), 1);
        tokio::time::timeout(Duration::from_secs(2), job.wait())
            .await
            .unwrap();

        match &job.outcomes()[0] {
            SlotOutcome::Failed(code) => assert_eq!(*code, ErrorCode::TtlExceeded),
            _ => panic!("expected terminal failure"),
        }
        assert_eq!(queue.user_load("1.1.1.1"), 0);
        assert!(handler.seen().iter().all(|(_, attempts)| *attempts <= 1));
        drop(tx);
    }

    #[tokio::test]
    async fn test_processing_never_exceeds_concurrency() {
        let handler = ScriptedHandler::new(vec![Ok(0); 6]);
        let queue = InspectQueue::new(handler.clone(), None, 3);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);
        queue.resize(2);

        let job = job("1.1.1.1", &["1", "2", "3", "4", "5", "6"]);
        queue.add_job(&job);
        settle(&queue, &job).await;

        assert!(handler.max_in_flight.load(Ordering::SeqCst) <= 2);
        drop(tx);
    }

    #[tokio::test]
    async fn test_zero_concurrency_holds_queue() {
        let handler = ScriptedHandler::new(vec![Ok(0)]);
        let queue = InspectQueue::new(handler.clone(), None, 3);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);

        let job = job("1.1.1.1", &["10"]);
        queue.add_job(&job);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.size(), 1);
        assert!(handler.seen().is_empty());

        // 就绪会话出现后并发抬升，队列开始排水
        queue.resize(1);
        settle(&queue, &job).await;
        assert_eq!(queue.size(), 0);
        drop(tx);
    }

    struct ClosedGate;
    impl CapacityGate for ClosedGate {
        fn can_accept(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_gate_blocks_dispatch() {
        let handler = ScriptedHandler::new(vec![Ok(0)]);
        let queue = InspectQueue::new(handler.clone(), Some(Arc::new(ClosedGate)), 3);
        let (tx, rx) = broadcast::channel(1);
        queue.start(rx);
        queue.resize(4);

        let job = job("1.1.1.1", &["10"]);
        queue.add_job(&job);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.size(), 1);
        assert!(handler.seen().is_empty());
        drop(tx);
    }
}
