//! HTTP request handlers organized by functionality

pub mod admin;
pub mod pause;
pub mod race;
pub mod tasks;

// Re-export handler functions
pub use admin::{
    InfoQuery, api_clear_db, api_delete_db_entry, api_get_config, api_info, api_list_db,
    api_routes, api_update_config,
};
pub use pause::{api_pause, api_pause_default, api_unpause, api_unpause_default};
pub use race::{api_post_race, api_race};
pub use tasks::{api_cancel_task, api_list_tasks, api_task_status};
