//! 追赶流程推进（CatchUpProcess）
//!
//! 每次 `process_all` 将每个未完成的追赶推进一步；状态以版本号条件写入，
//! 多个节点同时推进同一追赶时只有一个成功，另一个放弃本步。重复写入的历史
//! 副本由收件箱去重吸收，因此崩溃后从最后记录的位点恢复不会重复生效。
//!
//! 追赶完成后，同一投影更早完成的状态即被新状态取代并删除，投递阶段读取的
//! 状态数量只随投影数增长。
//!
use super::{CatchUpGate, CatchUpId, CatchUpState, CatchUpStatus, CatchUpStorage, EventLog, EventLogQuery};
use crate::clock::Clock;
use crate::error::{DeliveryError, DeliveryResult};
use crate::handler::HandlerRegistry;
use crate::inbox::{Inbox, Incoming};
use crate::message::{InboxLabel, Payload, Target, TypeUrl};
use crate::monitor::DeliveryMonitor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct CatchUpProcess {
    storage: Arc<dyn CatchUpStorage>,
    event_log: Arc<dyn EventLog>,
    inbox: Arc<Inbox>,
    handlers: HandlerRegistry,
    monitor: Arc<dyn DeliveryMonitor>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl CatchUpProcess {
    pub(crate) fn new(
        storage: Arc<dyn CatchUpStorage>,
        event_log: Arc<dyn EventLog>,
        inbox: Arc<Inbox>,
        handlers: HandlerRegistry,
        monitor: Arc<dyn DeliveryMonitor>,
        clock: Arc<dyn Clock>,
        page_size: usize,
    ) -> Self {
        Self {
            storage,
            event_log,
            inbox,
            handlers,
            monitor,
            clock,
            page_size,
        }
    }

    pub(crate) async fn start(
        &self,
        projection_type: TypeUrl,
        targets: Option<Vec<String>>,
        since: DateTime<Utc>,
    ) -> DeliveryResult<CatchUpId> {
        self.handlers.require(&projection_type)?;

        if let Some(running) = self
            .storage
            .read_all()
            .await?
            .into_iter()
            .find(|s| !s.is_completed() && s.projection_type() == &projection_type)
        {
            return Err(DeliveryError::CatchUpAlreadyStarted {
                projection_type: projection_type.to_string(),
                id: running.id().to_string(),
            });
        }

        let state = CatchUpState::start(projection_type, targets, since, self.clock.now())?;
        if !self.storage.write(&state, None).await? {
            return Err(DeliveryError::storage(format!(
                "catch-up {} already exists",
                state.id()
            )));
        }
        info!(
            catch_up = %state.id(),
            projection = %state.projection_type(),
            since = %state.since(),
            "catch-up started"
        );
        Ok(state.id())
    }

    pub(crate) async fn read(&self, id: CatchUpId) -> DeliveryResult<Option<CatchUpState>> {
        self.storage.read(id).await
    }

    pub(crate) async fn gate(&self) -> DeliveryResult<CatchUpGate> {
        Ok(CatchUpGate::new(self.storage.read_all().await?))
    }

    /// 推进全部未完成的追赶，返回本轮成功写入的新状态
    pub(crate) async fn process_all(&self) -> DeliveryResult<Vec<CatchUpState>> {
        let mut advanced = Vec::new();
        for state in self.storage.read_all().await? {
            if state.is_completed() {
                continue;
            }
            if let Some(next) = self.step(&state).await? {
                advanced.push(next);
            }
        }
        Ok(advanced)
    }

    async fn step(&self, state: &CatchUpState) -> DeliveryResult<Option<CatchUpState>> {
        let next = match state.status() {
            CatchUpStatus::Started | CatchUpStatus::InProgress => self.replay_page(state).await?,
            CatchUpStatus::CaughtUp => {
                let pending = self
                    .inbox
                    .count_pending(state.projection_type(), InboxLabel::CatchUp)
                    .await?;
                if pending > 0 {
                    debug!(catch_up = %state.id(), pending, "waiting for replayed messages");
                    return Ok(None);
                }
                state.completed(self.clock.now())
            }
            CatchUpStatus::Completed => return Ok(None),
        };

        if !self.storage.write(&next, Some(state.version())).await? {
            debug!(catch_up = %state.id(), "catch-up advanced by another worker");
            return Ok(None);
        }

        match next.status() {
            CatchUpStatus::Completed => {
                self.prune_superseded(&next).await?;
                info!(
                    catch_up = %next.id(),
                    projection = %next.projection_type(),
                    replayed = next.replayed(),
                    "catch-up completed"
                );
                self.monitor.on_catch_up_completed(&next);
            }
            CatchUpStatus::CaughtUp => {
                info!(catch_up = %next.id(), last_sequence = ?next.last_sequence(), "catch-up caught up");
            }
            _ => {}
        }
        Ok(Some(next))
    }

    async fn replay_page(&self, state: &CatchUpState) -> DeliveryResult<CatchUpState> {
        let handler = self.handlers.require(state.projection_type())?;
        let query = EventLogQuery::builder()
            .maybe_after_sequence(state.last_sequence())
            .since(state.since())
            .maybe_event_types(handler.handled_message_type().as_filter())
            .limit(self.page_size)
            .build();
        let events = self.event_log.read(&query).await?;

        let mut last_sequence = state.last_sequence();
        let mut started = state.started_targets().clone();
        let mut written = 0;
        for event in &events {
            let sequence = event.sequence_number().ok_or_else(|| {
                DeliveryError::corrupted(format!(
                    "event {} has no sequence number",
                    event.event_id()
                ))
            })?;

            for target_id in handler.route(event) {
                if !state.covers(state.projection_type(), &target_id) {
                    continue;
                }
                let target = match Target::new(state.projection_type().clone(), target_id) {
                    Ok(target) => target,
                    Err(err) => {
                        warn!(catch_up = %state.id(), event = event.event_id(), error = %err, "skipping unroutable event");
                        continue;
                    }
                };
                if !started.contains(target.id()) {
                    self.inbox
                        .write(Incoming {
                            target: target.clone(),
                            label: InboxLabel::CatchUp,
                            message_id: state.marker_id_for(target.id()),
                            payload: Payload::CatchUpStarted(state.id()),
                            catch_up: Some(state.id()),
                        })
                        .await?;
                    started.insert(target.id().to_string());
                }
                self.inbox
                    .write(Incoming {
                        target,
                        label: InboxLabel::CatchUp,
                        message_id: state.message_id_for(event.event_id()),
                        payload: Payload::Event(event.clone()),
                        catch_up: Some(state.id()),
                    })
                    .await?;
                written += 1;
            }
            last_sequence = Some(sequence);
        }

        let caught_up = events.len() < self.page_size;
        debug!(
            catch_up = %state.id(),
            read = events.len(),
            written,
            last_sequence = ?last_sequence,
            "catch-up page replayed"
        );
        Ok(state
            .advanced(last_sequence, written, caught_up, self.clock.now())
            .with_started_targets(started))
    }

    async fn prune_superseded(&self, completed: &CatchUpState) -> DeliveryResult<()> {
        for old in self.storage.read_all().await? {
            if old.is_completed()
                && old.id() != completed.id()
                && old.projection_type() == completed.projection_type()
            {
                self.storage.remove(old.id()).await?;
                debug!(catch_up = %old.id(), superseded_by = %completed.id(), "completed catch-up pruned");
            }
        }
        Ok(())
    }
}
