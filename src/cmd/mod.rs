//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                              |
//! |-----------|-----------------------------------------------|
//! | `gateway` | `Gateway`                                     |
//! | `worker`  | `Worker`                                      |
//! | `db`      | `DbMigrate`, `Status`                         |
//! | `tasks`   | `TasksList`, `TasksCreate`, `TasksShow`, `EventsTail` |

pub mod db;
pub mod gateway;
pub mod tasks;
pub mod worker;

pub use db::{cmd_migrate, cmd_status};
pub use gateway::cmd_gateway;
pub use tasks::{cmd_events_tail, cmd_tasks_create, cmd_tasks_list, cmd_tasks_show};
pub use worker::cmd_worker;
