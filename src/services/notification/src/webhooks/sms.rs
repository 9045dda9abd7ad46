//! SMS vendor webhooks: delivery status callbacks and inbound messages
//!
//! Status callbacks are always acknowledged once authenticated, so the
//! vendor never retries a callback we could not use.

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use serviceai_shared::types::{
    AppointmentStatus, Customer, InboundSms, Language, MessageDirection, MessageStatus,
    Organization, SmsProviderKind, SmsRecord, SmsStatusCallback, TemplateCategory,
};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{signature, WebhookIngress, INBOUND_SMS_PATH};
use crate::channels::STATUS_CALLBACK_PATH;
use crate::dispatcher::SendOptions;
use crate::error::{NotifyError, Result};
use crate::metrics::UpdateOutcome;
use crate::phone;
use crate::store::{StatusUpdate, StoreError};

/// What an inbound message caused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundAction {
    OptOut,
    OptIn,
    Help,
    Confirm,
    Reschedule,
    /// No keyword; left for a human to read
    Forwarded,
    /// Same `MessageSid` seen before; nothing was done
    Duplicate,
    /// Not addressed to a known organization, or not an inbound message
    Ignored,
}

impl InboundAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundAction::OptOut => "opt_out",
            InboundAction::OptIn => "opt_in",
            InboundAction::Help => "help",
            InboundAction::Confirm => "confirm",
            InboundAction::Reschedule => "reschedule",
            InboundAction::Forwarded => "forwarded",
            InboundAction::Duplicate => "duplicate",
            InboundAction::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundSmsResponse {
    pub success: bool,
    pub action: InboundAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InboundSmsResponse {
    fn new(action: InboundAction, message: Option<String>) -> Self {
        Self {
            success: true,
            action,
            message,
        }
    }
}

/// Keyword in the first word of the body, and the language it was written in
fn classify(body: &str) -> (InboundAction, Option<Language>) {
    let keyword = body
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_uppercase();

    match keyword.as_str() {
        "STOP" | "STOPALL" | "UNSUBSCRIBE" | "CANCEL" | "END" | "QUIT" => {
            (InboundAction::OptOut, Some(Language::En))
        }
        "ALTO" | "PARAR" => (InboundAction::OptOut, Some(Language::Es)),
        "START" | "UNSTOP" => (InboundAction::OptIn, Some(Language::En)),
        "INICIAR" => (InboundAction::OptIn, Some(Language::Es)),
        "HELP" | "INFO" => (InboundAction::Help, Some(Language::En)),
        "AYUDA" => (InboundAction::Help, Some(Language::Es)),
        "YES" | "Y" | "CONFIRM" => (InboundAction::Confirm, Some(Language::En)),
        "SI" | "SÍ" | "CONFIRMAR" => (InboundAction::Confirm, Some(Language::Es)),
        "RESCHEDULE" => (InboundAction::Reschedule, Some(Language::En)),
        "REPROGRAMAR" => (InboundAction::Reschedule, Some(Language::Es)),
        _ => (InboundAction::Forwarded, None),
    }
}

fn opt_out_text(organization: &Organization, language: Language) -> String {
    match language {
        Language::En => format!(
            "You have been unsubscribed from {} messages. Reply START to resubscribe.",
            organization.name
        ),
        Language::Es => format!(
            "Ya no recibirá mensajes de {}. Responda INICIAR para volver a suscribirse.",
            organization.name
        ),
    }
}

fn opt_in_text(organization: &Organization, language: Language) -> String {
    match language {
        Language::En => format!(
            "You are subscribed to {} messages again. Reply STOP to unsubscribe.",
            organization.name
        ),
        Language::Es => format!(
            "Está suscrito nuevamente a los mensajes de {}. Responda ALTO para cancelar.",
            organization.name
        ),
    }
}

fn help_text(organization: &Organization, language: Language) -> String {
    let phone = organization
        .transfer_phone
        .as_deref()
        .or(organization.voice_phone.as_deref());
    match (language, phone) {
        (Language::En, Some(phone)) => format!(
            "{}: call {} for help. Reply STOP to unsubscribe.",
            organization.name, phone
        ),
        (Language::En, None) => format!(
            "{}: reply with your question and we will get back to you. Reply STOP to unsubscribe.",
            organization.name
        ),
        (Language::Es, Some(phone)) => format!(
            "{}: llame al {} para recibir ayuda. Responda ALTO para cancelar.",
            organization.name, phone
        ),
        (Language::Es, None) => format!(
            "{}: responda con su pregunta y le contactaremos. Responda ALTO para cancelar.",
            organization.name
        ),
    }
}

fn confirm_text(confirmed: bool, language: Language) -> String {
    match (language, confirmed) {
        (Language::En, true) => "Thanks! Your appointment is confirmed.".to_string(),
        (Language::En, false) => {
            "We couldn't find an upcoming appointment for this number. Please call us to book."
                .to_string()
        }
        (Language::Es, true) => "¡Gracias! Su cita está confirmada.".to_string(),
        (Language::Es, false) => {
            "No encontramos una cita próxima para este número. Llámenos para reservar.".to_string()
        }
    }
}

fn reschedule_text(language: Language) -> String {
    match language {
        Language::En => {
            "Got it. A member of our team will contact you shortly to find a new time.".to_string()
        }
        Language::Es => {
            "Entendido. Un miembro de nuestro equipo le contactará pronto para buscar un nuevo horario."
                .to_string()
        }
    }
}

impl WebhookIngress {
    /// Apply a delivery status callback
    pub async fn handle_sms_status(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<()> {
        let params = signature::form_pairs(raw_body);
        self.verify_sms(headers, STATUS_CALLBACK_PATH, &params, "sms_status")?;

        let form: HashMap<String, String> = params.into_iter().collect();
        let Some(callback) = SmsStatusCallback::from_form(&form) else {
            warn!(
                fields = ?form.keys().collect::<Vec<_>>(),
                "Unrecognized SMS status callback acknowledged"
            );
            self.metrics.record_webhook("sms_status", "unrecognized");
            return Ok(());
        };

        let Some(status) = MessageStatus::from_provider(&callback.message_status) else {
            warn!(
                message_sid = %callback.message_sid,
                status = %callback.message_status,
                "Unknown provider status acknowledged"
            );
            self.metrics
                .record_status_update(None, UpdateOutcome::Unknown);
            self.metrics.record_webhook("sms_status", "unrecognized");
            return Ok(());
        };

        let update = StatusUpdate {
            status,
            error_code: callback.error_code,
            error_message: callback.error_message,
            at: Utc::now(),
        };
        let outcome = match self
            .tracker
            .record_status_update(&callback.message_sid, update)
            .await
        {
            Ok(UpdateOutcome::Applied) => "applied",
            Ok(UpdateOutcome::Duplicate) => "duplicate",
            Ok(UpdateOutcome::Unknown) => "unknown",
            Err(e) => {
                error!(
                    message_sid = %callback.message_sid,
                    error = %e,
                    "Failed to apply SMS status callback"
                );
                "error"
            }
        };
        self.metrics.record_webhook("sms_status", outcome);
        Ok(())
    }

    /// Record an inbound message once and act on its keyword
    pub async fn handle_inbound_sms(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<InboundSmsResponse> {
        let params = signature::form_pairs(raw_body);
        self.verify_sms(headers, INBOUND_SMS_PATH, &params, "sms_inbound")?;

        let form: HashMap<String, String> = params.into_iter().collect();
        let Some(inbound) = InboundSms::from_form(&form) else {
            warn!("Unrecognized inbound SMS payload acknowledged");
            self.metrics.record_webhook("sms_inbound", "unrecognized");
            return Ok(InboundSmsResponse::new(InboundAction::Ignored, None));
        };

        let response = self.inbound(inbound).await?;
        self.metrics
            .record_webhook("sms_inbound", response.action.as_str());
        Ok(response)
    }

    async fn inbound(&self, inbound: InboundSms) -> Result<InboundSmsResponse> {
        let from = phone::normalize(&inbound.from).unwrap_or_else(|_| inbound.from.clone());
        let to = phone::normalize(&inbound.to).unwrap_or_else(|_| inbound.to.clone());

        let Some(organization) = self.store.find_organization_by_phone(&to).await? else {
            warn!(to = %to, "Inbound SMS for unknown number ignored");
            return Ok(InboundSmsResponse::new(InboundAction::Ignored, None));
        };

        let customer = self
            .store
            .find_customer_by_phone(organization.id, &from)
            .await?;
        let (action, keyword_language) = classify(&inbound.body);
        let language = keyword_language
            .filter(|l| *l == Language::Es)
            .or(customer.as_ref().map(|c| c.language_preference))
            .unwrap_or(organization.default_language);

        let now = Utc::now();
        let record = SmsRecord {
            id: Uuid::new_v4(),
            organization_id: organization.id,
            workflow_id: None,
            appointment_id: None,
            customer_id: customer.as_ref().map(|c| c.id),
            direction: MessageDirection::Inbound,
            message_type: format!("inbound_{}", action.as_str()),
            category: TemplateCategory::Custom,
            language,
            language_fallback: false,
            to_phone: to,
            from_phone: Some(from.clone()),
            body: inbound.body.clone(),
            part: 1,
            total_parts: 1,
            segments: 1,
            status: MessageStatus::Received,
            provider: Some(SmsProviderKind::Twilio),
            external_message_id: Some(inbound.message_sid.clone()),
            error_code: None,
            error_message: None,
            cost: None,
            created_at: now,
            sent_at: None,
            delivered_at: Some(now),
            updated_at: now,
        };

        // Consent lands before the dedupe row so a vendor retry can finish it
        let consent = match action {
            InboundAction::OptOut => Some(false),
            InboundAction::OptIn => Some(true),
            _ => None,
        };
        if let Some(opt_in) = consent {
            self.set_opt_in(&organization, &from, customer.as_ref(), language, opt_in)
                .await?;
        }

        match self.store.insert_message(record).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                debug!(message_sid = %inbound.message_sid, "Inbound SMS replayed");
                return Ok(InboundSmsResponse::new(InboundAction::Duplicate, None));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            organization_id = %organization.id,
            message_sid = %inbound.message_sid,
            action = action.as_str(),
            "Inbound SMS received"
        );

        let reply = match action {
            InboundAction::OptOut => {
                // Carriers send the final confirmation; nothing more goes out
                return Ok(InboundSmsResponse::new(
                    action,
                    Some(opt_out_text(&organization, language)),
                ));
            }
            InboundAction::OptIn => Some(opt_in_text(&organization, language)),
            InboundAction::Help => Some(help_text(&organization, language)),
            InboundAction::Confirm => {
                let confirmed = match &customer {
                    Some(customer) => self.confirm_next_appointment(&organization, customer).await?,
                    None => false,
                };
                Some(confirm_text(confirmed, language))
            }
            InboundAction::Reschedule => Some(reschedule_text(language)),
            InboundAction::Forwarded | InboundAction::Duplicate | InboundAction::Ignored => None,
        };

        if let Some(text) = &reply {
            let mut options = SendOptions::new(TemplateCategory::Custom, "auto_reply", language);
            options.customer_id = customer.as_ref().map(|c| c.id);
            let result = self
                .dispatcher
                .send_direct(&organization, &from, text, &options)
                .await;
            if !result.success {
                warn!(
                    to = %from,
                    error = ?result.error,
                    "Auto-reply to inbound SMS failed"
                );
            }
        }

        Ok(InboundSmsResponse::new(action, reply))
    }

    /// Unknown senders get a customer row so an opt-out sticks
    async fn set_opt_in(
        &self,
        organization: &Organization,
        phone: &str,
        customer: Option<&Customer>,
        language: Language,
        opt_in: bool,
    ) -> Result<()> {
        if customer.is_some() {
            self.store
                .set_customer_opt_in(organization.id, phone, opt_in)
                .await?;
        } else {
            let now = Utc::now();
            self.store
                .upsert_customer(Customer {
                    id: Uuid::new_v4(),
                    organization_id: organization.id,
                    name: None,
                    phone: phone.to_string(),
                    email: None,
                    language_preference: language,
                    sms_opt_in: opt_in,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }
        info!(organization_id = %organization.id, opt_in, "SMS consent changed");
        Ok(())
    }

    async fn confirm_next_appointment(
        &self,
        organization: &Organization,
        customer: &Customer,
    ) -> Result<bool> {
        let now_local = organization.local_time(Utc::now());
        let Some(appointment) = self
            .store
            .find_next_appointment_for_customer(organization.id, customer.id, now_local)
            .await?
        else {
            return Ok(false);
        };

        if appointment.status == AppointmentStatus::Confirmed {
            return Ok(true);
        }
        match self
            .store
            .update_appointment_status(organization.id, appointment.id, AppointmentStatus::Confirmed)
            .await
        {
            Ok(_) => {
                info!(appointment_id = %appointment.id, "Appointment confirmed by SMS");
                Ok(true)
            }
            Err(StoreError::Conflict { message }) => {
                warn!(appointment_id = %appointment.id, %message, "Appointment could not be confirmed");
                Ok(false)
            }
            Err(e) => Err(NotifyError::from(e)),
        }
    }
}
