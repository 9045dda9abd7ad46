//! Voice assistant webhooks
//!
//! The vendor reads back whatever `result` we return for each tool call, so
//! every path, including failures, produces `{"results":[{toolCallId, result}]}`.
//! Only a bad signature is answered with an error status.

use axum::http::HeaderMap;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use serviceai_shared::types::{
    Appointment, AppointmentEvent, AppointmentStatus, BookAppointmentParams, CallInfo,
    CallTransfer, CheckAvailabilityParams, Customer, EmergencyNotification, EmergencyStatus,
    EscalateEmergencyParams, FlatToolCall, Language, Organization, TemplateCategory,
    ToolCallResponse, ToolResult, TransferCallParams, TransferPriority, VoiceEnvelope,
    VoiceServerMessage,
};
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::WebhookIngress;
use crate::dispatcher::SendOptions;
use crate::error::{NotifyError, Result};
use crate::phone;
use crate::store::EmergencyUpdate;

const DEFAULT_DURATION_MINUTES: i32 = 60;
const MIN_DURATION_MINUTES: i32 = 15;

static BARE_HOUR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})\s*([AaPp][Mm])$").expect("valid regex"));

const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p"];

/// A voice webhook after parsing
#[derive(Debug)]
enum VoiceEvent {
    ToolCalls {
        call: CallInfo,
        invocations: Vec<ToolInvocation>,
    },
    CallStatus {
        call_id: Option<String>,
        status: Option<String>,
    },
    CallEnded {
        call_id: Option<String>,
        reason: Option<String>,
    },
    /// A message type the vendor sends that we have no use for
    Unsupported,
    /// Neither the envelope nor the flat tool-call shape
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
struct ToolInvocation {
    id: String,
    name: String,
    arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    TransferCall,
    EscalateEmergency,
    CheckAvailability,
    BookAppointment,
}

impl Tool {
    /// Accepts camelCase, snake_case and kebab-case spellings
    fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "transfercall" | "transfertohuman" => Some(Tool::TransferCall),
            "escalateemergency" | "emergencyescalation" => Some(Tool::EscalateEmergency),
            "checkavailability" => Some(Tool::CheckAvailability),
            "bookappointment" => Some(Tool::BookAppointment),
            _ => None,
        }
    }
}

struct CallContext {
    organization: Organization,
    call_id: Option<String>,
    caller_phone: Option<String>,
    language: Language,
}

fn parse_event(raw_body: &[u8], tool: Option<&str>) -> VoiceEvent {
    if let Ok(envelope) = serde_json::from_slice::<VoiceEnvelope>(raw_body) {
        return match envelope.message {
            VoiceServerMessage::ToolCalls {
                call,
                tool_call_list,
            } => VoiceEvent::ToolCalls {
                call: call.unwrap_or_default(),
                invocations: tool_call_list
                    .into_iter()
                    .map(|item| ToolInvocation {
                        id: item.id,
                        name: item.function.name,
                        arguments: item.function.arguments,
                    })
                    .collect(),
            },
            VoiceServerMessage::StatusUpdate { call, status } => VoiceEvent::CallStatus {
                call_id: call.and_then(|c| c.id),
                status,
            },
            VoiceServerMessage::EndOfCallReport { call, ended_reason } => VoiceEvent::CallEnded {
                call_id: call.and_then(|c| c.id),
                reason: ended_reason,
            },
            VoiceServerMessage::Unsupported => VoiceEvent::Unsupported,
        };
    }

    if let Ok(flat) = serde_json::from_slice::<FlatToolCall>(raw_body) {
        let name = tool
            .map(str::to_string)
            .or(flat.name)
            .unwrap_or_default();
        return VoiceEvent::ToolCalls {
            call: flat.call.unwrap_or_default(),
            invocations: vec![ToolInvocation {
                id: flat.tool_call_id,
                name,
                arguments: flat.parameters,
            }],
        };
    }

    VoiceEvent::Unrecognized
}

/// Tool arguments arrive either as an object or as a JSON-encoded string
fn arguments<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let value = match value {
        Value::Null => json!({}),
        Value::String(s) if s.trim().is_empty() => json!({}),
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| NotifyError::validation("parameters", e.to_string()))?,
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| NotifyError::validation("parameters", e.to_string()))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        NotifyError::validation("date", format!("expected YYYY-MM-DD, got '{}'", raw))
    })
}

fn parse_time(raw: &str) -> Result<NaiveTime> {
    let trimmed = raw.trim();
    let normalized = match BARE_HOUR.captures(trimmed) {
        Some(caps) => format!("{}:00 {}", &caps[1], &caps[2]),
        None => trimmed.to_string(),
    };
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(&normalized, format).ok())
        .ok_or_else(|| NotifyError::validation("time", format!("unrecognized time '{}'", raw)))
}

fn spoken_time(time: NaiveTime, language: Language) -> String {
    match language {
        Language::En => time.format("%-I:%M %p").to_string(),
        Language::Es => time.format("%H:%M").to_string(),
    }
}

fn spoken_date(date: NaiveDate, language: Language) -> String {
    match language {
        Language::En => date.format("%m/%d/%Y").to_string(),
        Language::Es => date.format("%d/%m/%Y").to_string(),
    }
}

/// Hourly starts inside business hours that are in the future and clear of
/// every non-cancelled appointment
fn free_slots(
    organization: &Organization,
    date: NaiveDate,
    duration: Duration,
    booked: &[Appointment],
    now_local: NaiveDateTime,
) -> Vec<NaiveTime> {
    if !organization.is_business_day(date) {
        return Vec::new();
    }

    let close = date.and_time(organization.business_hours_end);
    let mut start = date.and_time(organization.business_hours_start);
    let mut slots = Vec::new();
    while start + duration <= close {
        let end = start + duration;
        if start > now_local && !booked.iter().any(|a| a.overlaps(start, end)) {
            slots.push(start.time());
        }
        start = start + Duration::hours(1);
    }
    slots
}

fn transfer_result(transfer: &CallTransfer, language: Language) -> Value {
    let message = match (language, transfer.priority) {
        (Language::En, TransferPriority::Urgent) => {
            "I'm connecting you with our emergency technician right now. Please stay on the line."
        }
        (Language::En, _) => "I'm transferring you to a member of our team now. Please hold.",
        (Language::Es, TransferPriority::Urgent) => {
            "Le estoy comunicando con nuestro técnico de emergencias ahora mismo. Por favor, no cuelgue."
        }
        (Language::Es, _) => {
            "Le estoy transfiriendo con un miembro de nuestro equipo. Por favor, espere."
        }
    };

    json!({
        "success": true,
        "action": "transfer",
        "transferTo": transfer.transfer_to,
        "message": message,
        "transferMode": "warm-transfer",
        "priority": transfer.priority.as_str(),
    })
}

fn availability_result(date: NaiveDate, slots: &[NaiveTime], language: Language) -> Value {
    let spoken: Vec<String> = slots.iter().map(|t| spoken_time(*t, language)).collect();
    let message = match (language, spoken.is_empty()) {
        (Language::En, true) => {
            "I'm sorry, we don't have any openings that day. Would another day work?".to_string()
        }
        (Language::En, false) => format!(
            "We have openings at {}. Which time works best for you?",
            spoken.join(", ")
        ),
        (Language::Es, true) => {
            "Lo siento, no tenemos disponibilidad ese día. ¿Le funciona otro día?".to_string()
        }
        (Language::Es, false) => format!(
            "Tenemos disponibilidad a las {}. ¿Qué hora le conviene más?",
            spoken.join(", ")
        ),
    };

    json!({
        "success": true,
        "date": date.format("%Y-%m-%d").to_string(),
        "available": !slots.is_empty(),
        "slots": slots.iter().map(|t| t.format("%H:%M").to_string()).collect::<Vec<_>>(),
        "message": message,
    })
}

fn booking_result(appointment: &Appointment, language: Language) -> Value {
    let service = appointment.service_type.replace('_', " ");
    let date = spoken_date(appointment.scheduled_date, language);
    let time = spoken_time(appointment.scheduled_time, language);
    let message = match language {
        Language::En => format!(
            "You're all set! Your {} appointment is booked for {} at {}. We'll text you a confirmation.",
            service, date, time
        ),
        Language::Es => format!(
            "¡Listo! Su cita de {} quedó reservada para el {} a las {}. Le enviaremos una confirmación por mensaje de texto.",
            service, date, time
        ),
    };

    json!({
        "success": true,
        "booked": true,
        "appointmentId": appointment.id,
        "date": appointment.scheduled_date.format("%Y-%m-%d").to_string(),
        "time": appointment.scheduled_time.format("%H:%M").to_string(),
        "message": message,
    })
}

fn not_booked(reason: &str, message: &str) -> Value {
    json!({
        "success": false,
        "booked": false,
        "reason": reason,
        "message": message,
    })
}

fn spoken_error(code: &str, language: Language) -> Value {
    let message = match language {
        Language::En => {
            "I'm sorry, I couldn't complete that request. Let me connect you with someone who can help."
        }
        Language::Es => {
            "Lo siento, no pude completar esa solicitud. Permítame comunicarle con alguien que pueda ayudarle."
        }
    };
    json!({
        "success": false,
        "error": code,
        "message": message,
    })
}

impl WebhookIngress {
    /// Vendor envelope or a flat tool call posted to the general endpoint
    pub async fn handle_voice_webhook(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<ToolCallResponse> {
        self.verify_voice(headers, raw_body)?;
        Ok(self.voice_event(parse_event(raw_body, None)).await)
    }

    /// A tool call posted to its own endpoint; the path names the tool
    pub async fn handle_tool_call(
        &self,
        tool: &str,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<ToolCallResponse> {
        self.verify_voice(headers, raw_body)?;
        Ok(self.voice_event(parse_event(raw_body, Some(tool))).await)
    }

    async fn voice_event(&self, event: VoiceEvent) -> ToolCallResponse {
        match event {
            VoiceEvent::ToolCalls { call, invocations } => {
                self.metrics.record_webhook("voice", "tool_calls");
                self.tool_calls(&call, invocations).await
            }
            VoiceEvent::CallStatus { call_id, status } => {
                info!(call_id = ?call_id, status = ?status, "Call status update");
                self.metrics.record_webhook("voice", "status_update");
                ToolCallResponse::default()
            }
            VoiceEvent::CallEnded { call_id, reason } => {
                info!(call_id = ?call_id, reason = ?reason, "Call ended");
                self.metrics.record_webhook("voice", "end_of_call");
                ToolCallResponse::default()
            }
            VoiceEvent::Unsupported => {
                debug!("Ignoring unsupported voice message type");
                self.metrics.record_webhook("voice", "ignored");
                ToolCallResponse::default()
            }
            VoiceEvent::Unrecognized => {
                warn!("Unrecognized voice webhook payload acknowledged");
                self.metrics.record_webhook("voice", "unrecognized");
                ToolCallResponse::default()
            }
        }
    }

    async fn tool_calls(&self, call: &CallInfo, invocations: Vec<ToolInvocation>) -> ToolCallResponse {
        let context = self.call_context(call).await;
        if let Err(e) = &context {
            warn!(call_id = ?call.id, error = %e, "Could not resolve organization for call");
        }

        let mut results = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let result = match &context {
                Ok(context) => match self.run_tool(context, &invocation).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            tool = %invocation.name,
                            tool_call_id = %invocation.id,
                            error = %e,
                            "Tool call failed"
                        );
                        spoken_error(e.error_code(), context.language)
                    }
                },
                Err(e) => spoken_error(
                    e.error_code(),
                    call.metadata.language.unwrap_or_default(),
                ),
            };
            results.push(ToolResult {
                tool_call_id: invocation.id,
                result,
            });
        }

        ToolCallResponse { results }
    }

    /// The organization comes from call metadata, else from the number that
    /// was dialled
    async fn call_context(&self, call: &CallInfo) -> Result<CallContext> {
        let organization = match call.metadata.organization_id {
            Some(id) => self.store.get_organization(id).await?,
            None => match call.phone_number.as_ref().and_then(|p| p.number.as_deref()) {
                Some(number) => {
                    let number = phone::normalize(number).unwrap_or_else(|_| number.to_string());
                    self.store.find_organization_by_phone(&number).await?
                }
                None => None,
            },
        }
        .ok_or_else(|| NotifyError::not_found("organization for call"))?;

        if !organization.is_active {
            return Err(NotifyError::forbidden(format!(
                "organization {} is inactive",
                organization.id
            )));
        }

        Ok(CallContext {
            language: call
                .metadata
                .language
                .unwrap_or(organization.default_language),
            caller_phone: call.customer.as_ref().and_then(|c| c.number.clone()),
            call_id: call.id.clone(),
            organization,
        })
    }

    #[instrument(skip(self, context, invocation), fields(tool = %invocation.name, tool_call_id = %invocation.id))]
    async fn run_tool(&self, context: &CallContext, invocation: &ToolInvocation) -> Result<Value> {
        let tool = Tool::from_name(&invocation.name).ok_or_else(|| {
            NotifyError::validation("tool", format!("unknown tool '{}'", invocation.name))
        })?;

        match tool {
            Tool::TransferCall => {
                self.transfer_call(context, &invocation.id, arguments(&invocation.arguments)?)
                    .await
            }
            Tool::EscalateEmergency => {
                self.escalate_emergency(context, &invocation.id, arguments(&invocation.arguments)?)
                    .await
            }
            Tool::CheckAvailability => {
                self.check_availability(context, arguments(&invocation.arguments)?)
                    .await
            }
            Tool::BookAppointment => {
                self.book_appointment(context, &invocation.id, arguments(&invocation.arguments)?)
                    .await
            }
        }
    }

    async fn transfer_call(
        &self,
        context: &CallContext,
        tool_call_id: &str,
        params: TransferCallParams,
    ) -> Result<Value> {
        let organization = &context.organization;
        let transfer_to = organization
            .transfer_phone
            .clone()
            .or_else(|| organization.emergency_contact_phone.clone())
            .ok_or_else(|| {
                NotifyError::validation("transferTo", "organization has no transfer number")
            })?;

        let priority = params
            .urgency
            .as_deref()
            .and_then(|u| u.parse::<TransferPriority>().ok())
            .unwrap_or(TransferPriority::Normal);

        let transfer = self
            .record_transfer(CallTransfer {
                id: Uuid::new_v4(),
                organization_id: organization.id,
                tool_call_id: tool_call_id.to_string(),
                call_id: context.call_id.clone(),
                transfer_to,
                reason: params.reason,
                caller_phone: params.caller_phone.or_else(|| context.caller_phone.clone()),
                priority,
                emergency_id: None,
                created_at: Utc::now(),
            })
            .await;

        Ok(transfer_result(&transfer, context.language))
    }

    /// Log the emergency, alert the contact and hand back a transfer. The
    /// transfer is returned whether or not the SMS went out.
    async fn escalate_emergency(
        &self,
        context: &CallContext,
        tool_call_id: &str,
        params: EscalateEmergencyParams,
    ) -> Result<Value> {
        let organization = &context.organization;
        let now = Utc::now();

        let on_call = match self.store.find_on_call_contact(organization.id, now).await {
            Ok(contact) => contact,
            Err(e) => {
                warn!(
                    organization_id = %organization.id,
                    error = %e,
                    "On-call lookup failed, using organization emergency contact"
                );
                None
            }
        };
        let (contact_id, contact_name, contact_phone) = match on_call {
            Some(contact) => (Some(contact.id), Some(contact.name), contact.phone),
            None => {
                let phone = organization.emergency_contact_phone.clone().ok_or_else(|| {
                    NotifyError::validation("contact", "organization has no emergency contact")
                })?;
                (None, organization.emergency_contact_name.clone(), phone)
            }
        };

        let draft = EmergencyNotification {
            id: Uuid::new_v4(),
            organization_id: organization.id,
            tool_call_id: tool_call_id.to_string(),
            call_id: context.call_id.clone(),
            contact_id,
            contact_name,
            contact_phone,
            emergency_type: params.emergency_type,
            severity: params.severity.unwrap_or_default(),
            description: params.description,
            location: params.location,
            caller_phone: params.caller_phone.or_else(|| context.caller_phone.clone()),
            status: EmergencyStatus::Pending,
            sms_message_id: None,
            last_error: None,
            created_at: now,
            sent_at: None,
            resolved_at: None,
            resolved_by: None,
        };

        // The caller is still transferred when the log write fails
        let inserted = self.store.insert_emergency_if_absent(draft.clone()).await;
        let (is_new, emergency) = match inserted {
            Ok(outcome) => (outcome.is_new(), outcome.into_inner()),
            Err(e) => {
                error!(
                    organization_id = %organization.id,
                    tool_call_id,
                    error = %e,
                    "Failed to log emergency, alerting and transferring anyway"
                );
                (true, draft)
            }
        };
        if is_new {
            warn!(
                emergency_id = %emergency.id,
                organization_id = %organization.id,
                severity = emergency.severity.as_str(),
                emergency_type = %emergency.emergency_type,
                "Emergency escalated"
            );
            self.alert_contact(organization, &emergency).await;
        } else {
            info!(
                emergency_id = %emergency.id,
                "Emergency tool call replayed, alert not resent"
            );
        }

        let transfer = self
            .record_transfer(CallTransfer {
                id: Uuid::new_v4(),
                organization_id: organization.id,
                tool_call_id: tool_call_id.to_string(),
                call_id: context.call_id.clone(),
                transfer_to: emergency.contact_phone.clone(),
                reason: Some(emergency.emergency_type.clone()),
                caller_phone: emergency.caller_phone.clone(),
                priority: emergency.severity.into(),
                emergency_id: Some(emergency.id),
                created_at: now,
            })
            .await;

        Ok(transfer_result(&transfer, context.language))
    }

    /// The alert goes to staff, so it renders in the organization's language
    async fn alert_contact(&self, organization: &Organization, emergency: &EmergencyNotification) {
        let language = organization.default_language;
        let unknown = match language {
            Language::En => "unknown",
            Language::Es => "desconocido",
        };
        let variables: HashMap<String, Value> = [
            ("severity", json!(emergency.severity.as_str())),
            ("business_name", json!(organization.name)),
            (
                "emergency_type",
                json!(emergency.emergency_type.replace('_', " ")),
            ),
            (
                "location",
                json!(emergency.location.as_deref().unwrap_or(unknown)),
            ),
            (
                "caller_phone",
                json!(emergency.caller_phone.as_deref().unwrap_or(unknown)),
            ),
            (
                "description",
                json!(emergency.description.as_deref().unwrap_or(unknown)),
            ),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        let failure = match self
            .templates
            .render_template(organization, "emergency_alert", language, &variables)
            .await
        {
            Ok(rendered) => {
                let mut options = SendOptions::new(
                    TemplateCategory::Emergency,
                    &rendered.template_key,
                    rendered.language,
                );
                options.language_fallback = rendered.fallback;
                let result = self
                    .dispatcher
                    .send_direct(organization, &emergency.contact_phone, &rendered.text, &options)
                    .await;
                if result.success {
                    self.update_emergency(
                        organization,
                        emergency,
                        EmergencyStatus::Sent,
                        result.message_id,
                        None,
                    )
                    .await;
                    return;
                }
                result.error.unwrap_or_else(|| "send failed".to_string())
            }
            Err(e) => e.to_string(),
        };

        error!(
            emergency_id = %emergency.id,
            error = %failure,
            "Emergency alert SMS failed"
        );
        self.update_emergency(
            organization,
            emergency,
            EmergencyStatus::Pending,
            None,
            Some(failure),
        )
        .await;
    }

    async fn update_emergency(
        &self,
        organization: &Organization,
        emergency: &EmergencyNotification,
        status: EmergencyStatus,
        sms_message_id: Option<Uuid>,
        last_error: Option<String>,
    ) {
        let update = EmergencyUpdate {
            status,
            sms_message_id,
            last_error,
            resolved_by: None,
            at: Utc::now(),
        };
        if let Err(e) = self
            .store
            .update_emergency_status(organization.id, emergency.id, &update)
            .await
        {
            error!(emergency_id = %emergency.id, error = %e, "Failed to update emergency");
        }
    }

    /// A store failure here is logged and the transfer still goes ahead
    async fn record_transfer(&self, transfer: CallTransfer) -> CallTransfer {
        match self.store.insert_transfer_if_absent(transfer.clone()).await {
            Ok(outcome) => {
                if outcome.is_new() {
                    info!(
                        tool_call_id = %transfer.tool_call_id,
                        transfer_to = %transfer.transfer_to,
                        priority = transfer.priority.as_str(),
                        "Call transfer recorded"
                    );
                } else {
                    debug!(tool_call_id = %transfer.tool_call_id, "Call transfer replayed");
                }
                outcome.into_inner()
            }
            Err(e) => {
                error!(
                    tool_call_id = %transfer.tool_call_id,
                    error = %e,
                    "Failed to record call transfer"
                );
                transfer
            }
        }
    }

    async fn check_availability(
        &self,
        context: &CallContext,
        params: CheckAvailabilityParams,
    ) -> Result<Value> {
        let organization = &context.organization;
        let date = parse_date(&params.date)?;
        let minutes = params
            .duration_minutes
            .unwrap_or(DEFAULT_DURATION_MINUTES)
            .max(MIN_DURATION_MINUTES);

        let booked = self.store.list_appointments_on(organization.id, date).await?;
        let slots = free_slots(
            organization,
            date,
            Duration::minutes(i64::from(minutes)),
            &booked,
            organization.local_time(Utc::now()),
        );

        debug!(date = %date, slots = slots.len(), "Availability checked");
        Ok(availability_result(date, &slots, context.language))
    }

    async fn book_appointment(
        &self,
        context: &CallContext,
        tool_call_id: &str,
        params: BookAppointmentParams,
    ) -> Result<Value> {
        let organization = &context.organization;
        let phone = phone::normalize(&params.customer_phone)?;
        let date = parse_date(&params.date)?;
        let time = parse_time(&params.time)?;
        let duration_minutes = params
            .duration_minutes
            .unwrap_or(DEFAULT_DURATION_MINUTES)
            .max(MIN_DURATION_MINUTES);
        let language = params.language.unwrap_or(context.language);

        let start = date.and_time(time);
        let end = start + Duration::minutes(i64::from(duration_minutes));

        let booked = self.store.list_appointments_on(organization.id, date).await?;
        if let Some(existing) = booked
            .iter()
            .find(|a| a.tool_call_id.as_deref() == Some(tool_call_id))
        {
            info!(appointment_id = %existing.id, "Booking tool call replayed");
            return Ok(booking_result(existing, language));
        }

        let now = Utc::now();
        if organization.to_utc(start) <= now {
            return Ok(not_booked(
                "in_past",
                match language {
                    Language::En => "That time has already passed. What other time works for you?",
                    Language::Es => "Esa hora ya pasó. ¿Qué otra hora le conviene?",
                },
            ));
        }
        if booked.iter().any(|a| a.overlaps(start, end)) {
            return Ok(not_booked(
                "slot_taken",
                match language {
                    Language::En => {
                        "I'm sorry, that time was just taken. Would you like to hear other openings?"
                    }
                    Language::Es => {
                        "Lo siento, esa hora ya está ocupada. ¿Quiere escuchar otros horarios disponibles?"
                    }
                },
            ));
        }

        let customer = self
            .store
            .upsert_customer(Customer {
                id: Uuid::new_v4(),
                organization_id: organization.id,
                name: params.customer_name,
                phone,
                email: None,
                language_preference: language,
                sms_opt_in: true,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let outcome = self
            .store
            .insert_appointment_if_absent(Appointment {
                id: Uuid::new_v4(),
                organization_id: organization.id,
                customer_id: Some(customer.id),
                service_type: params.service_type,
                scheduled_date: date,
                scheduled_time: time,
                duration_minutes,
                status: AppointmentStatus::Pending,
                language: Some(language),
                address: params.address,
                notes: params.notes,
                tool_call_id: Some(tool_call_id.to_string()),
                created_at: now,
                updated_at: now,
            })
            .await?;

        let is_new = outcome.is_new();
        let appointment = outcome.into_inner();
        if is_new {
            info!(
                appointment_id = %appointment.id,
                customer_id = %customer.id,
                "Appointment booked by voice assistant"
            );
            if let Err(e) = self
                .engine
                .handle_appointment_event(organization.id, appointment.id, AppointmentEvent::Created)
                .await
            {
                error!(
                    appointment_id = %appointment.id,
                    error = %e,
                    "Failed to schedule appointment notifications"
                );
            }
        }

        Ok(booking_result(&appointment, language))
    }
}
