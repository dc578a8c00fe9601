use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use ddd_delivery::config::DeliveryConfig;
use ddd_delivery::delivery::Delivery;
use ddd_delivery::engine::{DeliveryEngine, EngineConfig};
use ddd_delivery::event::SerializedEvent;
use ddd_delivery::handler::{DispatchError, HandledMessageType, MessageHandler};
use ddd_delivery::memory::{InMemoryEventLog, InMemoryInboxStorage};
use ddd_delivery::message::{CommandMessage, InboxMessage, Payload, Target, TypeUrl};
use ddd_delivery::shard::UniformAcrossAllShards;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const ACCOUNT: &str = "bank/Account";
const BALANCES: &str = "bank/BalanceView";

/// 账户聚合：处理存取款命令，成功后把事件追加到事件日志并投递给余额视图
struct Accounts {
    balances: Mutex<HashMap<String, i64>>,
    log: Arc<InMemoryEventLog>,
    delivery: Mutex<Option<Arc<Delivery>>>,
}

#[async_trait]
impl MessageHandler for Accounts {
    fn handler_name(&self) -> &str {
        "accounts"
    }

    fn target_type(&self) -> TypeUrl {
        TypeUrl::new(ACCOUNT)
    }

    fn handled_message_type(&self) -> HandledMessageType {
        HandledMessageType::Many(vec!["Deposit".into(), "Withdraw".into()])
    }

    async fn dispatch(&self, message: &InboxMessage) -> Result<(), DispatchError> {
        let Payload::Command(command) = message.payload() else {
            return Err(DispatchError::fatal(anyhow::anyhow!("commands only")));
        };
        let account = message.target().id().to_string();
        let amount = command.payload()["amount"].as_i64().unwrap_or_default();
        let (event_type, delta) = match command.command_type() {
            "Deposit" => ("Deposited", amount),
            _ => ("Withdrawn", -amount),
        };

        {
            let mut balances = self.balances.lock().unwrap();
            let balance = balances.entry(account.clone()).or_default();
            if *balance + delta < 0 {
                return Err(DispatchError::fatal(anyhow::anyhow!(
                    "insufficient funds on {account}"
                )));
            }
            *balance += delta;
        }

        let event = self
            .log
            .append(
                SerializedEvent::builder()
                    .event_id(Ulid::new().to_string())
                    .event_type(event_type.to_string())
                    .aggregate_id(account.clone())
                    .aggregate_type(ACCOUNT.to_string())
                    .causation_id(command.command_id().to_string())
                    .occurred_at(Utc::now())
                    .payload(serde_json::json!({ "delta": delta }))
                    .build(),
            )
            .await;

        let delivery = self.delivery.lock().unwrap().clone();
        if let Some(delivery) = delivery {
            let target = Target::new(BALANCES, account).map_err(DispatchError::fatal)?;
            delivery
                .enqueue_event(target, event)
                .await
                .map_err(DispatchError::recoverable)?;
        }
        Ok(())
    }
}

/// 余额视图：一个读模型投影
#[derive(Default)]
struct BalanceView {
    rows: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl MessageHandler for BalanceView {
    fn handler_name(&self) -> &str {
        "balance-view"
    }

    fn target_type(&self) -> TypeUrl {
        TypeUrl::new(BALANCES)
    }

    fn handled_message_type(&self) -> HandledMessageType {
        HandledMessageType::Many(vec!["Deposited".into(), "Withdrawn".into()])
    }

    async fn dispatch(&self, message: &InboxMessage) -> Result<(), DispatchError> {
        let Some(event) = message.payload().as_event() else {
            return Err(DispatchError::fatal(anyhow::anyhow!("events only")));
        };
        let delta = event.payload()["delta"].as_i64().unwrap_or_default();
        *self
            .rows
            .lock()
            .unwrap()
            .entry(message.target().id().to_string())
            .or_default() += delta;
        Ok(())
    }

    async fn on_catch_up_started(&self, target_id: &str) -> Result<(), DispatchError> {
        self.rows.lock().unwrap().remove(target_id);
        Ok(())
    }
}

fn command(ty: &str, amount: i64) -> CommandMessage {
    CommandMessage::builder()
        .command_id(Ulid::new().to_string())
        .command_type(ty.to_string())
        .payload(serde_json::json!({ "amount": amount }))
        .build()
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let log = Arc::new(InMemoryEventLog::new());
    let inbox = Arc::new(InMemoryInboxStorage::new());
    let accounts = Arc::new(Accounts {
        balances: Mutex::new(HashMap::new()),
        log: log.clone(),
        delivery: Mutex::new(None),
    });
    let view = Arc::new(BalanceView::default());

    let delivery = Arc::new(
        Delivery::builder()
            .handlers(vec![
                accounts.clone() as Arc<dyn MessageHandler>,
                view.clone() as Arc<dyn MessageHandler>,
            ])
            .strategy(Arc::new(UniformAcrossAllShards::for_shards(4)?))
            .inbox_storage(inbox.clone())
            .event_log(log.clone())
            .config(DeliveryConfig {
                page_size: 16,
                catch_up_page_size: 8,
                ..DeliveryConfig::default()
            })
            .build()?,
    );

    // 账户 a-0 的历史：视图尚未接入时产生的事件
    for amount in [100, 20, 5] {
        log.append(
            SerializedEvent::builder()
                .event_id(Ulid::new().to_string())
                .event_type("Deposited".to_string())
                .aggregate_id("a-0".to_string())
                .aggregate_type(ACCOUNT.to_string())
                .occurred_at(Utc::now())
                .payload(serde_json::json!({ "delta": amount }))
                .build(),
        )
        .await;
    }
    accounts
        .balances
        .lock()
        .unwrap()
        .insert("a-0".to_string(), 125);
    *accounts.delivery.lock().unwrap() = Some(delivery.clone());

    let catch_up = delivery
        .start_catch_up(
            TypeUrl::new(BALANCES),
            None,
            Utc::now() - TimeDelta::hours(1),
        )
        .await?;

    let engine_config = EngineConfig {
        deliver_interval: Duration::from_millis(50),
        catch_up_interval: Duration::from_millis(20),
        sweep_interval: Duration::from_secs(1),
    };
    let handles: Vec<_> = ["w1", "w2"]
        .into_iter()
        .map(|name| {
            Arc::new(
                DeliveryEngine::builder()
                    .delivery(delivery.clone())
                    .worker_name(name)
                    .config(engine_config)
                    .build(),
            )
            .start()
        })
        .collect();

    for i in 0..8 {
        let account = Target::new(ACCOUNT, format!("a-{}", i % 4))?;
        delivery
            .enqueue_command(account.clone(), command("Deposit", 50))
            .await?;
        delivery
            .enqueue_command(account, command("Withdraw", 10))
            .await?;
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let completed = delivery
                .catch_up_state(catch_up)
                .await
                .map(|s| s.is_completed())
                .unwrap_or(false);
            if completed && inbox.pending().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    for handle in handles {
        handle.shutdown();
        handle.join().await;
    }

    let mut rows: Vec<(String, i64)> = view
        .rows
        .lock()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    rows.sort();
    for (account, balance) in rows {
        info!(%account, balance, "balance view");
    }
    info!(
        duplicates = delivery.duplicates_absorbed(),
        events = log.len().await,
        "demo finished"
    );
    Ok(())
}
