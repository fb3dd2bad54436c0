//! 验证作业协调器进程：装配服务、运行后台循环和 HTTP 服务器。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
