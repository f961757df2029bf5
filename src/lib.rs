//! 音声アシスタント端末向けリアルタイムバックエンド
//!
//! 端末ごとに1本の永続WebSocket接続を保持し、上りの圧縮音声を
//! 発話単位に区切って認識し、対話生成・音声合成を経て下りフレームとして
//! 返すセッションエンジンです。
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod providers;
pub mod report;
pub mod segmenter;
pub mod server;
pub mod session;
pub mod vad;
