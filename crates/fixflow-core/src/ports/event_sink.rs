//! EventSink port - 遷移イベントの送信先
//!
//! すべての遷移（admission を含む）が `TransitionRecord` として 1 回ずつ送られます。
//! 送信失敗で pipeline を止めないこと（sink は fire-and-forget）。

use crate::domain::TransitionRecord;

pub trait EventSink: Send + Sync {
    fn emit(&self, record: &TransitionRecord);
}

/// Fan-out to several sinks.
impl<S: EventSink + ?Sized> EventSink for Vec<std::sync::Arc<S>> {
    fn emit(&self, record: &TransitionRecord) {
        for sink in self {
            sink.emit(record);
        }
    }
}
