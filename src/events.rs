use crate::model::EntityId;
use crate::push::ConnectionState;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    FetchFailed { entity_id: EntityId, error: String },
    ConnectionChanged(ConnectionState),
    MalformedEvent { reason: String },
    LivenessChanged { entity_id: EntityId, online: bool },
}
