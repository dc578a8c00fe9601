//! 投递引擎（DeliveryEngine）
//!
//! 以一个工作者身份驱动 `Delivery` 的长驻任务：
//! - 投递循环：定时或收到新消息写入通知时，依次尝试投递每个分片；
//! - 追赶循环：周期推进未完成的追赶；
//! - 清扫循环：周期清除过期租约，并唤醒投递循环接手；
//! - 提供关闭与等待的 `EngineHandle`。
//!
//! 暂时性存储错误只记录告警，下一个周期自然重试。
//!
use crate::delivery::Delivery;
use crate::error::DeliveryError;
use crate::registry::WorkerId;
use bon::Builder;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::delivery_engine_builder::{IsUnset, SetWorker, State as BuilderState};

#[derive(Builder)]
pub struct DeliveryEngine {
    delivery: Arc<Delivery>,
    worker: WorkerId,
    #[builder(default)]
    config: EngineConfig,
}

impl<S: BuilderState> DeliveryEngineBuilder<S> {
    /// 以随机节点 ID 生成工作者身份
    pub fn worker_name(self, name: impl Into<String>) -> DeliveryEngineBuilder<SetWorker<S>>
    where
        <S as BuilderState>::Worker: IsUnset,
    {
        self.worker(WorkerId::generate(name))
    }
}

impl DeliveryEngine {
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// 启动投递引擎，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> EngineHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        // deliver worker（长循环）
        tasks.push(tokio::spawn(Self::deliver_loop(self.clone(), token.clone())));

        // catch-up worker（周期任务）
        {
            let delivery = self.delivery.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.catch_up_interval,
                move || {
                    let delivery = delivery.clone();
                    async move {
                        if let Err(err) = delivery.process_catch_ups().await {
                            report("catch-up", &err);
                        }
                    }
                },
            ));
        }

        // sweep worker（周期任务）
        {
            let delivery = self.delivery.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.sweep_interval,
                move || {
                    let delivery = delivery.clone();
                    async move {
                        match delivery.release_expired_sessions().await {
                            Ok(released) if !released.is_empty() => {
                                delivery.write_notifier().notify_one();
                            }
                            Ok(_) => {}
                            Err(err) => report("lease sweep", &err),
                        }
                    }
                },
            ));
        }

        EngineHandle { token, tasks }
    }

    /// 依次尝试投递每个分片，返回本轮投递的消息数
    pub async fn deliver_once(&self, token: &CancellationToken) -> usize {
        let mut delivered = 0;
        for shard in self.delivery.shards() {
            if token.is_cancelled() {
                break;
            }
            match self
                .delivery
                .deliver_messages_until(shard, &self.worker, token)
                .await
            {
                Ok(Some(stats)) => delivered += stats.delivered(),
                Ok(None) => {}
                Err(err) => report("delivery", &err),
            }
        }
        delivered
    }

    async fn deliver_loop(self: Arc<Self>, token: CancellationToken) {
        let written = self.delivery.write_notifier();
        let mut ticker = time::interval(self.config.deliver_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                _ = written.notified() => {}
            }
            let delivered = self.deliver_once(&token).await;
            if delivered > 0 {
                debug!(worker = %self.worker, delivered, "delivery round finished");
            }
        }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }
}

fn report(task: &str, err: &DeliveryError) {
    if err.is_transient() {
        warn!(task, error = %err, "transient failure, retrying next round");
    } else {
        error!(task, error = %err, "engine task failed");
    }
}

/// 投递引擎配置
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// 无写入通知时的投递轮询间隔
    pub deliver_interval: Duration,
    /// 追赶推进间隔
    pub catch_up_interval: Duration,
    /// 过期租约清扫间隔
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deliver_interval: Duration::from_secs(1),
            catch_up_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// 引擎运行句柄：用于优雅关闭与等待任务结束
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DispatchError, HandledMessageType, MessageHandler};
    use crate::message::{CommandMessage, InboxMessage, Target, TypeUrl};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        fn handler_name(&self) -> &str {
            "recorder"
        }
        fn target_type(&self) -> TypeUrl {
            TypeUrl::new("test/Order")
        }
        fn handled_message_type(&self) -> HandledMessageType {
            HandledMessageType::All
        }
        async fn dispatch(&self, message: &InboxMessage) -> Result<(), DispatchError> {
            self.seen
                .lock()
                .unwrap()
                .push(message.message_id().to_string());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_delivers_on_write_and_stops_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![recorder.clone()];
        let delivery = Arc::new(Delivery::builder().handlers(handlers).build().unwrap());
        let engine = Arc::new(
            DeliveryEngine::builder()
                .delivery(delivery.clone())
                .worker_name("w1")
                .config(EngineConfig {
                    deliver_interval: Duration::from_secs(60),
                    ..EngineConfig::default()
                })
                .build(),
        );
        let handle = engine.start();

        let target = Target::new("test/Order", "o-1").unwrap();
        for id in ["c-1", "c-2", "c-3"] {
            let command = CommandMessage::builder()
                .command_id(id.to_string())
                .command_type("orders.Place".to_string())
                .payload(serde_json::json!({}))
                .build();
            delivery
                .enqueue_command(target.clone(), command)
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if recorder.seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown();
        handle.join().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["c-1", "c-2", "c-3"]);
    }
}
