pub mod channel_store;
pub mod connection;
pub mod option_store;
pub mod token_store;

pub use channel_store::{ChannelStore, SqliteChannelStore};
pub use connection::{create_sqlite_pool, initialize_database, memory_pool, run_migrations};
pub use option_store::{OptionStore, SqliteOptionStore, GLOBAL_MODEL_MAPPING_KEY};
pub use token_store::{SqliteTokenStore, TokenStore};
