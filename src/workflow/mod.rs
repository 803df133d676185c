//! 执行图中唯一的动态部分：检索扇出与扇入屏障

pub mod barrier;
pub mod fanout;

pub use barrier::{JoinBarrier, JoinError};
pub use fanout::fan_out;
