pub mod conversations;
pub mod messages;
pub mod presence;
pub mod read_state;
