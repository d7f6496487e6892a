// GLM (Zhipu) converter.
//
// GLM's chat-completions wire format is OpenAI-compatible (same request and
// SSE chunk shape), so there is nothing to translate: requests reuse
// `ChatCompletionRequest` and route through `openai_anthropic` exactly like
// a native OpenAI request. This module exists as the explicit hook other
// converters attach to, documenting that the pass-through is deliberate
// rather than an unimplemented conversion.

pub use super::openai_anthropic::openai_to_anthropic_request as glm_to_anthropic_request;
