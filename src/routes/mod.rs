mod agents;
mod groups;
mod messages;
mod system;

pub use agents::{
    approve, deregister, get_webhook, heartbeat, inbox_stats, register, rotate_key, set_webhook, delete_webhook,
};
pub use groups::{add_member, create as create_group, get as get_group, history as group_history, join as join_group, leave as leave_group, post_message};
pub use messages::{ack, nack, pull, reply, send, status};
pub use system::{health, stats};
