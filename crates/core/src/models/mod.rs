//! # 数据模型
//!
//! 协调器的核心数据结构：作业、决策、任务、调度器/节点、Blob 与决策进度。
//!
//! ## 包含关系
//!
//! ```text
//! Job ──1:N──> Decision ──1:N──> Task
//! Scheduler ──1:N──> Node
//! Blob (按摘要寻址，被 Decision/Task 引用计数)
//! ```
//!
//! ## 任务状态流转
//!
//! ```text
//! PENDING → PROCESSING → FINISHED
//!    ↓          ↓    ↘
//! CANCELLED  CANCELLED  ERROR ──(瞬时故障且未超过重试上限)──> PENDING
//! ```
//!
//! 所有时间字段使用 `DateTime<Utc>`，所有状态字段使用枚举，
//! 在数据库中以大写文本保存。

pub mod blob;
pub mod decision;
pub mod job;
pub mod progress;
pub mod scheduler;
pub mod task;

pub use blob::*;
pub use decision::*;
pub use job::*;
pub use progress::*;
pub use scheduler::*;
pub use task::*;

/// 为以大写文本保存的状态枚举生成 SQLite 编解码实现
///
/// 枚举需提供 `as_str()` 和 `FromStr<Err = String>`。
#[macro_export]
macro_rules! impl_sqlite_text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                s.parse::<$ty>().map_err(Into::into)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
