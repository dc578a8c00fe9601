//! 消息处理器（MessageHandler）
//!
//! 一个处理器负责一种目标类型（聚合、流程管理器或投影）：声明它接受的消息类型，
//! 并对投递到某个目标实例的消息执行业务逻辑。处理器在构造 `Delivery` 时一次性
//! 登记到按目标类型索引的查找表中，运行时不做反射或动态发现。
//!
//! 处理器必须对同一条消息的重复调用保持幂等：至少一次投递的语义由核心保证，
//! 恰好一次的效果由处理器（或调用方的去重）保证。
//!
use crate::error::{DeliveryError, DeliveryResult};
use crate::event::SerializedEvent;
use crate::message::{InboxMessage, TypeUrl};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Debug)]
pub enum HandledMessageType {
    One(String),
    Many(Vec<String>),
    All,
}

impl HandledMessageType {
    pub fn matches(&self, message_type: &str) -> bool {
        match self {
            HandledMessageType::All => true,
            HandledMessageType::One(t) => t == message_type,
            HandledMessageType::Many(ts) => ts.iter().any(|t| t == message_type),
        }
    }

    /// 供事件日志过滤使用；`None` 表示不过滤
    pub fn as_filter(&self) -> Option<Vec<String>> {
        match self {
            HandledMessageType::All => None,
            HandledMessageType::One(t) => Some(vec![t.clone()]),
            HandledMessageType::Many(ts) => Some(ts.clone()),
        }
    }
}

/// 处理失败的分类
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 暂时性失败：消息留在收件箱原位，后续轮次按原顺序重试
    #[error("recoverable dispatch failure: {0}")]
    Recoverable(anyhow::Error),
    /// 致命失败：重试无意义（如毒消息），由监控决定如何处置
    #[error("fatal dispatch failure: {0}")]
    Fatal(anyhow::Error),
}

impl DispatchError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理器名称（用于日志与失败标记）
    fn handler_name(&self) -> &str;

    /// 处理器负责的目标类型
    fn target_type(&self) -> TypeUrl;

    /// 处理器支持的消息类型
    fn handled_message_type(&self) -> HandledMessageType;

    fn accepts(&self, message_type: &str) -> bool {
        self.handled_message_type().matches(message_type)
    }

    /// 追赶时将历史事件路由到目标实例，默认按事件的生产者 ID
    fn route(&self, event: &SerializedEvent) -> Vec<String> {
        vec![event.aggregate_id().to_string()]
    }

    /// 处理投递到 `message.target()` 的一条消息
    async fn dispatch(&self, message: &InboxMessage) -> Result<(), DispatchError>;

    /// 追赶即将为实例 `target_id` 重放历史事件，先于它的第一条历史副本调用。
    /// 投影应在此丢弃该实例的现有状态，随后由重放从 `since` 起重建；
    /// 否则追赶开始前已实时应用过的事件会再应用一次。
    async fn on_catch_up_started(&self, _target_id: &str) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    by_type: HashMap<TypeUrl, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> DeliveryResult<Self> {
        let mut by_type: HashMap<TypeUrl, Arc<dyn MessageHandler>> = HashMap::new();

        for h in handlers {
            let target_type = h.target_type();
            if let Some(existing) = by_type.get(&target_type) {
                return Err(DeliveryError::invalid_config(format!(
                    "handlers `{}` and `{}` both serve {target_type}",
                    existing.handler_name(),
                    h.handler_name()
                )));
            }
            by_type.insert(target_type, h);
        }

        Ok(Self { by_type })
    }

    pub(crate) fn get(&self, target_type: &TypeUrl) -> Option<&Arc<dyn MessageHandler>> {
        self.by_type.get(target_type)
    }

    pub(crate) fn require(&self, target_type: &TypeUrl) -> DeliveryResult<&Arc<dyn MessageHandler>> {
        self.get(target_type)
            .ok_or_else(|| DeliveryError::UnknownTarget {
                type_url: target_type.to_string(),
            })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        target_type: &'static str,
    }

    #[async_trait]
    impl MessageHandler for Named {
        fn handler_name(&self) -> &str {
            self.name
        }
        fn target_type(&self) -> TypeUrl {
            TypeUrl::new(self.target_type)
        }
        fn handled_message_type(&self) -> HandledMessageType {
            HandledMessageType::Many(vec!["a".into(), "b".into()])
        }
        async fn dispatch(&self, _message: &InboxMessage) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    #[test]
    fn handled_message_type_matching() {
        assert!(HandledMessageType::All.matches("anything"));
        assert!(HandledMessageType::One("x".into()).matches("x"));
        assert!(!HandledMessageType::One("x".into()).matches("y"));
        let many = HandledMessageType::Many(vec!["a".into(), "b".into()]);
        assert!(many.matches("b"));
        assert!(!many.matches("c"));
        assert_eq!(HandledMessageType::All.as_filter(), None);
        assert_eq!(many.as_filter(), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn registry_resolves_by_target_type() {
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![
            Arc::new(Named { name: "orders", target_type: "t/Order" }),
            Arc::new(Named { name: "carts", target_type: "t/Cart" }),
        ];
        let registry = HandlerRegistry::new(handlers).unwrap();
        assert_eq!(registry.require(&TypeUrl::new("t/Cart")).unwrap().handler_name(), "carts");
        assert!(registry.get(&TypeUrl::new("t/Order")).unwrap().accepts("a"));
        match registry.require(&TypeUrl::new("t/Unknown")) {
            Err(DeliveryError::UnknownTarget { type_url }) => assert_eq!(type_url, "t/Unknown"),
            other => panic!("unexpected {:?}", other.map(|h| h.handler_name().to_string())),
        }
    }

    #[test]
    fn two_handlers_for_one_type_is_a_config_error() {
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![
            Arc::new(Named { name: "first", target_type: "t/Order" }),
            Arc::new(Named { name: "second", target_type: "t/Order" }),
        ];
        let err = HandlerRegistry::new(handlers).err().unwrap();
        match err {
            DeliveryError::InvalidConfig { reason } => assert!(reason.contains("second")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dispatch_errors_classify() {
        assert!(DispatchError::recoverable(anyhow::anyhow!("busy")).is_recoverable());
        assert!(!DispatchError::fatal(anyhow::anyhow!("poison")).is_recoverable());
    }
}
