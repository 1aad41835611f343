pub mod claude;
pub mod openai;

pub use claude::{ClaudeMessage, ClaudeRequest, ClaudeResponse, ClaudeStreamEvent, ClaudeUsage};
pub use openai::{
    AudioSpeechRequest, AudioTranscriptionRequest, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, Choice, CompletionRequest, Delta, EmbeddingData, EmbeddingRequest,
    EmbeddingResponse, ImageRequest, Message, ModelList, ModelObject, RerankRequest,
    RerankResponse, RerankResult, StreamChoice, Usage,
};
