//! Protocol types: JSON-RPC envelopes, MCP content, capabilities,
//! per-method parameter/result structs, and task wire types.

pub mod capabilities;
pub mod content;
pub mod jsonrpc;
pub mod protocol;
pub mod tasks;

pub use capabilities::{
    ClientCapabilities, ElicitationCapabilities, LoggingCapabilities, PromptCapabilities,
    ResourceCapabilities, RootsCapabilities, SamplingCapabilities, ServerCapabilities,
    TaskCapabilities, ToolCapabilities,
};
pub use content::{Annotations, Content, PromptContent, ResourceContents, Role};
pub use jsonrpc::{
    parse_frame, Frame, JSONRPCError, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse,
    RequestId, ResponsePayload, JSONRPC_VERSION,
};
pub use protocol::{
    methods, CallToolParams, CallToolResult, CancelTaskParams, CancelledParams,
    CreateMessageParams, CreateMessageResult, Cursor, ElicitAction, ElicitParams, ElicitResult,
    GetPromptParams, GetPromptResult, GetTaskParams, Icon, Implementation, InitializeParams,
    InitializeResult, ListPromptsParams, ListPromptsResult, ListResourceTemplatesParams,
    ListResourceTemplatesResult, ListResourcesParams, ListResourcesResult, ListRootsResult,
    ListTasksParams, ListTasksResult, ListToolsParams, ListToolsResult, LoggingLevel,
    LoggingMessageParams, ModelHint, ModelPreferences, ProgressParams, ProgressToken, Prompt,
    PromptArgument, PromptMessage, ReadResourceParams, ReadResourceResult, RequestMeta, Resource,
    ResourceTemplate, Root, SamplingMessage, SetLevelParams, TaskSupport, Tool, ToolAnnotations,
    ToolExecution, UrlElicitation,
};
pub use tasks::{
    CancelTaskResult, CreateTaskResult, GetTaskResult, Task, TaskRequestParams, TaskStatus,
};
