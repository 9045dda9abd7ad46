//! Shared type definitions for the ServiceAI platform
//!
//! Domain entities live in [`core`], dashboard API payloads in [`api`] and
//! vendor webhook payloads in [`events`].

pub mod api;
pub mod core;
pub mod events;

pub use self::core::{
    Appointment, AppointmentStatus, CallTransfer, Customer, EmergencyContact,
    EmergencyNotification, EmergencySeverity, EmergencyStatus, Language, MessageDirection,
    MessageStatus, NotificationTemplate, Organization, SmsProviderKind, SmsRecord, StepKind,
    StepPolicy, StepStatus, TemplateCategory, TimeRange, TransferPriority, Workflow,
    WorkflowStatus, WorkflowStep, WorkflowType,
};

pub use self::api::{
    AnalyticsQuery, AnalyticsResponse, ApiResponse, AppointmentEvent, AppointmentEventRequest,
    CancelWorkflowRequest, CreateWorkflowRequest, DeliveryStatistics, DispatchResult,
    EmergencyResolution, ExecutionSummary, HealthCheckResponse, LanguagePerformance,
    ProviderChoice, RenderedTemplate, ResolveEmergencyRequest, SaveTemplateRequest,
    TemplateListQuery, TemplatePerformance, TemplatePreviewRequest, TrendBucket, WorkflowMetrics,
};

pub use self::events::{
    BookAppointmentParams, CallInfo, CallMetadata, CheckAvailabilityParams,
    EscalateEmergencyParams, FlatToolCall, InboundSms, PhoneRef, SmsStatusCallback,
    ToolCallItem, ToolCallResponse, ToolFunction, ToolResult, TransferCallParams, VoiceEnvelope,
    VoiceServerMessage,
};
