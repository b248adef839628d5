// mediasort 库接口
// 服务端与客户端二进制共享的核心实现

pub mod batcher;
pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod http;
pub mod index;
pub mod media;
pub mod metadata;
pub mod path_alloc;
pub mod queue;
pub mod rate_limit;
pub mod walker;
