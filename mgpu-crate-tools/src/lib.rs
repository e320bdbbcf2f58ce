//! mgpu 工具集
//!
//! 目前只提供日志初始化：driver 内部的 crate 只依赖 `log` facade，
//! 由可执行程序或测试在启动时选择 backend。

pub mod init_log;
