//! 可编排的传输层替身，供本 crate 与上层的测试使用

use crate::transport::{Credentials, Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use common::model::item::RawItem;
use errors::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// log_on 后自动走完 LoggedOn → GcConnected
    pub auto_login: bool,
    pub owns_game: bool,
    /// send_inspect 后立即回包，itemid 取请求的 asset id
    pub auto_reply: bool,
    pub reply_paintwear: Option<f64>,
    /// 登录直接失败，携带 (eresult, message)
    pub fail_logon: Option<(Option<i32>, String)>,
}

impl MockBehavior {
    pub fn healthy() -> Self {
        MockBehavior {
            auto_login: true,
            owns_game: false,
            auto_reply: true,
            reply_paintwear: Some(0.25),
            fail_logon: None,
        }
    }
}

struct Created {
    proxy: Option<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Arc<Mutex<Vec<String>>>,
}

pub struct MockFactory {
    behavior: MockBehavior,
    created: Mutex<Vec<Created>>,
}

impl MockFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        MockFactory {
            behavior,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn proxy_of(&self, index: usize) -> Option<String> {
        self.created.lock().unwrap().get(index)?.proxy.clone()
    }

    pub fn calls(&self, index: usize) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .get(index)
            .map(|c| c.calls.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// 从测试侧注入一个传输层事件
    pub fn emit(&self, index: usize, event: TransportEvent) {
        if let Some(created) = self.created.lock().unwrap().get(index) {
            let _ = created.events.send(event);
        }
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        proxy_url: Option<&str>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Transport>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        self.created.lock().unwrap().push(Created {
            proxy: proxy_url.map(str::to_string),
            events: events.clone(),
            calls: calls.clone(),
        });
        Ok(Box::new(MockTransport {
            behavior: self.behavior.clone(),
            events,
            calls,
        }))
    }
}

pub struct MockTransport {
    behavior: MockBehavior,
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.record("connect");
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn log_on(&mut self, credentials: &Credentials) -> Result<()> {
        self.record(format!("log_on:{}", credentials.username));
        if let Some((eresult, message)) = &self.behavior.fail_logon {
            let _ = self.events.send(TransportEvent::LogonFailed {
                eresult: *eresult,
                message: message.clone(),
            });
            return Ok(());
        }
        if self.behavior.auto_login {
            let _ = self.events.send(TransportEvent::LoggedOn {
                owns_game: self.behavior.owns_game,
            });
        }
        Ok(())
    }

    async fn request_license(&mut self, app_id: u32) -> Result<()> {
        self.record(format!("request_license:{app_id}"));
        Ok(())
    }

    async fn set_games_played(&mut self, app_ids: &[u32]) -> Result<()> {
        let rendered = app_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.record(format!("games_played:[{rendered}]"));
        if !app_ids.is_empty() && self.behavior.auto_login {
            let _ = self.events.send(TransportEvent::GcConnected);
        }
        Ok(())
    }

    async fn send_inspect(&mut self, owner: &str, asset_id: &str, d: &str) -> Result<()> {
        self.record(format!("send_inspect:{owner}:{asset_id}:{d}"));
        if self.behavior.auto_reply {
            let _ = self.events.send(TransportEvent::InspectReply(RawItem {
                itemid: asset_id.parse().unwrap_or(0),
                paintwear: self.behavior.reply_paintwear,
                ..Default::default()
            }));
        }
        Ok(())
    }

    async fn log_off(&mut self) -> Result<()> {
        self.record("log_off");
        Ok(())
    }
}
