//! Template store
//!
//! Versioned, bilingual message templates rendered with Handlebars.
//! Resolution for a `(key, language)` pair tries, per language, an active
//! organization override, then an active stored system template, then the
//! built-in template shipped with the service. Languages are tried in the
//! order requested, organization default, service default; anything other
//! than the requested language is reported as a fallback.

use chrono::Utc;
use handlebars::{handlebars_helper, no_escape, Handlebars};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use serviceai_shared::types::{
    Language, NotificationTemplate, Organization, RenderedTemplate, SaveTemplateRequest,
    TemplateCategory,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use crate::config::TemplateConfig;
use crate::error::{NotifyError, Result};
use crate::store::{Persistence, TemplateFilter};

/// `{{name}}` or `{{helper name}}`
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*(?:[a-zA-Z_][a-zA-Z0-9_]*\s+)?([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}")
        .expect("valid regex")
});

static TEMPLATE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid regex"));

handlebars_helper!(upper: |s: str| s.to_uppercase());

/// A template chosen for a request, with whether it came from a fallback
/// language
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    pub template: NotificationTemplate,
    pub fallback: bool,
}

pub struct TemplateStore {
    store: Arc<dyn Persistence>,
    config: TemplateConfig,
    handlebars: Arc<RwLock<Handlebars<'static>>>,
    builtins: HashMap<(String, Language), NotificationTemplate>,
}

impl TemplateStore {
    pub fn new(store: Arc<dyn Persistence>, config: &TemplateConfig) -> Result<Self> {
        info!("Initializing template store");

        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(no_escape);
        handlebars.set_strict_mode(true);
        handlebars.register_helper("upper", Box::new(upper));

        let mut builtins = HashMap::new();
        for template in builtin_templates() {
            handlebars.register_template_string(&registry_name(&template), &template.content)?;
            builtins.insert(
                (template.template_key.clone(), template.language),
                template,
            );
        }

        info!(
            builtin_templates = builtins.len(),
            "Template store initialized"
        );

        Ok(Self {
            store,
            config: config.clone(),
            handlebars: Arc::new(RwLock::new(handlebars)),
            builtins,
        })
    }

    /// Resolve the template for `(key, language)`, falling back through the
    /// organization's and the service's default language
    pub async fn get_template(
        &self,
        organization: &Organization,
        key: &str,
        language: Language,
    ) -> Result<Option<ResolvedTemplate>> {
        let mut candidates = vec![language];
        for lang in [organization.default_language, self.config.default_language] {
            if !candidates.contains(&lang) {
                candidates.push(lang);
            }
        }

        for lang in candidates {
            if let Some(template) = self.lookup(organization.id, key, lang).await? {
                if lang != language {
                    debug!(
                        template_key = key,
                        requested = %language,
                        used = %lang,
                        "Template language fallback"
                    );
                }
                return Ok(Some(ResolvedTemplate {
                    template,
                    fallback: lang != language,
                }));
            }
        }

        Ok(None)
    }

    /// Render a template. Every declared variable and every placeholder must
    /// be supplied with a non-null value.
    pub async fn render_template(
        &self,
        organization: &Organization,
        key: &str,
        language: Language,
        variables: &HashMap<String, Value>,
    ) -> Result<RenderedTemplate> {
        let resolved = self
            .get_template(organization, key, language)
            .await?
            .ok_or_else(|| NotifyError::TemplateNotFound {
                key: key.to_string(),
                language: language.to_string(),
            })?;
        let template = &resolved.template;

        for name in template
            .variables
            .iter()
            .cloned()
            .chain(placeholders(&template.content))
        {
            match variables.get(&name) {
                None | Some(Value::Null) => return Err(NotifyError::missing_variable(name)),
                Some(_) => {}
            }
        }

        let name = registry_name(template);
        let registered = self.handlebars.read().await.has_template(&name);
        if !registered {
            let mut handlebars = self.handlebars.write().await;
            handlebars.register_template_string(&name, &template.content)?;
        }

        let context = serde_json::to_value(variables)?;
        let text = self.handlebars.read().await.render(&name, &context)?;

        Ok(RenderedTemplate {
            template_key: template.template_key.clone(),
            text: text.trim().to_string(),
            requested_language: language,
            language: template.language,
            fallback: resolved.fallback,
            category: template.category,
            version: template.version,
        })
    }

    /// Create or replace an organization template; replacing bumps `version`
    pub async fn save_template(&self, request: SaveTemplateRequest) -> Result<NotificationTemplate> {
        request.validate()?;

        if !TEMPLATE_KEY.is_match(&request.template_key) {
            return Err(NotifyError::validation(
                "templateKey",
                "template key must be lowercase snake_case",
            ));
        }
        if !self.config.supported_languages.contains(&request.language) {
            return Err(NotifyError::validation(
                "language",
                format!("language '{}' is not supported", request.language),
            ));
        }

        validate_template_syntax(&request.content)?;

        let used: HashSet<String> = placeholders(&request.content).collect();
        if let Some(unused) = request.variables.iter().find(|v| !used.contains(*v)) {
            return Err(NotifyError::validation(
                "variables",
                format!("declared variable '{}' does not appear in the content", unused),
            ));
        }
        if let Some(undeclared) = used.iter().find(|p| !request.variables.contains(p)) {
            return Err(NotifyError::validation(
                "content",
                format!("placeholder '{}' is not declared", undeclared),
            ));
        }

        let now = Utc::now();
        let template = NotificationTemplate {
            id: Uuid::new_v4(),
            organization_id: Some(request.organization_id),
            template_key: request.template_key,
            language: request.language,
            content: request.content,
            variables: request.variables,
            category: request.category,
            is_active: request.is_active.unwrap_or(true),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let saved = self.store.upsert_template(template).await?;
        if saved.version > 1 {
            self.forget_compiled(&saved).await;
        }
        info!(
            organization_id = %request.organization_id,
            template_key = %saved.template_key,
            language = %saved.language,
            version = saved.version,
            "Template saved"
        );
        Ok(saved)
    }

    /// Organization overrides, stored system templates and built-ins not
    /// shadowed by a stored system row
    pub async fn list_templates(
        &self,
        organization_id: Uuid,
        filter: &TemplateFilter,
    ) -> Result<Vec<NotificationTemplate>> {
        let mut templates = self.store.list_templates(organization_id, filter).await?;

        let stored_system: HashSet<(String, Language)> = templates
            .iter()
            .filter(|t| t.organization_id.is_none())
            .map(|t| (t.template_key.clone(), t.language))
            .collect();

        let mut builtins: Vec<NotificationTemplate> = self
            .builtins
            .values()
            .filter(|t| {
                filter.matches(t) && !stored_system.contains(&(t.template_key.clone(), t.language))
            })
            .cloned()
            .collect();
        builtins.sort_by(|a, b| {
            (&a.template_key, a.language.as_str()).cmp(&(&b.template_key, b.language.as_str()))
        });

        templates.extend(builtins);
        Ok(templates)
    }

    async fn lookup(
        &self,
        organization_id: Uuid,
        key: &str,
        language: Language,
    ) -> Result<Option<NotificationTemplate>> {
        if let Some(template) = self
            .store
            .find_template(Some(organization_id), key, language)
            .await?
            .filter(|t| t.is_active)
        {
            return Ok(Some(template));
        }

        if let Some(template) = self
            .store
            .find_template(None, key, language)
            .await?
            .filter(|t| t.is_active)
        {
            return Ok(Some(template));
        }

        Ok(self.builtins.get(&(key.to_string(), language)).cloned())
    }

    /// Drop compiled copies of earlier versions of a replaced template
    async fn forget_compiled(&self, saved: &NotificationTemplate) {
        let prefix = format!("{}:", saved.id);
        let current = registry_name(saved);
        let mut handlebars = self.handlebars.write().await;
        let stale: Vec<String> = handlebars
            .get_templates()
            .keys()
            .filter(|name| name.starts_with(&prefix) && **name != current)
            .cloned()
            .collect();
        for name in &stale {
            handlebars.unregister_template(name);
        }
        if !stale.is_empty() {
            debug!(template_id = %saved.id, dropped = stale.len(), "Dropped stale compiled templates");
        }
    }
}

/// Variable names referenced by the template, in order of appearance
pub fn placeholders(content: &str) -> impl Iterator<Item = String> + '_ {
    PLACEHOLDER
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
}

fn validate_template_syntax(content: &str) -> Result<()> {
    let mut handlebars = Handlebars::new();
    handlebars.register_helper("upper", Box::new(upper));
    handlebars
        .register_template_string("validation", content)
        .map_err(|e| NotifyError::template(format!("Template syntax error: {}", e)))?;
    Ok(())
}

fn registry_name(template: &NotificationTemplate) -> String {
    format!("{}:{}", template.id, template.version)
}

fn builtin_templates() -> Vec<NotificationTemplate> {
    use Language::{En, Es};
    use TemplateCategory::*;

    let appointment_vars: &[&str] = &[
        "customer_name",
        "business_name",
        "appointment_date",
        "appointment_time",
        "service_type",
    ];
    let alert_vars: &[&str] = &[
        "severity",
        "business_name",
        "emergency_type",
        "location",
        "caller_phone",
        "description",
    ];
    let escalation_vars: &[&str] = &[
        "contact_name",
        "business_name",
        "emergency_type",
        "location",
        "caller_phone",
    ];
    let follow_up_vars: &[&str] = &["customer_name", "business_name", "service_type"];
    let survey_vars: &[&str] = &["business_name"];

    let definitions: Vec<(&str, Language, TemplateCategory, &[&str], &str)> = vec![
        (
            "appointment_confirmation",
            En,
            Confirmation,
            appointment_vars,
            "Hi {{customer_name}}, your {{service_type}} appointment with {{business_name}} is confirmed for {{appointment_date}} at {{appointment_time}}. Reply YES to confirm or RESCHEDULE to change it.",
        ),
        (
            "appointment_confirmation",
            Es,
            Confirmation,
            appointment_vars,
            "Hola {{customer_name}}, su cita de {{service_type}} con {{business_name}} está confirmada para el {{appointment_date}} a las {{appointment_time}}. Responda SI para confirmar o REPROGRAMAR para cambiarla.",
        ),
        (
            "appointment_reminder",
            En,
            Reminder,
            appointment_vars,
            "Reminder: {{customer_name}}, your {{service_type}} appointment with {{business_name}} is on {{appointment_date}} at {{appointment_time}}. Reply RESCHEDULE if you need to change it.",
        ),
        (
            "appointment_reminder",
            Es,
            Reminder,
            appointment_vars,
            "Recordatorio: {{customer_name}}, su cita de {{service_type}} con {{business_name}} es el {{appointment_date}} a las {{appointment_time}}. Responda REPROGRAMAR si necesita cambiarla.",
        ),
        (
            "appointment_cancellation",
            En,
            Cancellation,
            appointment_vars,
            "Hi {{customer_name}}, your {{service_type}} appointment with {{business_name}} on {{appointment_date}} at {{appointment_time}} has been cancelled. Call us any time to book again.",
        ),
        (
            "appointment_cancellation",
            Es,
            Cancellation,
            appointment_vars,
            "Hola {{customer_name}}, su cita de {{service_type}} con {{business_name}} del {{appointment_date}} a las {{appointment_time}} ha sido cancelada. Llámenos para reservar de nuevo.",
        ),
        (
            "emergency_alert",
            En,
            Emergency,
            alert_vars,
            "{{upper severity}} EMERGENCY for {{business_name}}: {{emergency_type}} at {{location}}. Caller: {{caller_phone}}. Details: {{description}}",
        ),
        (
            "emergency_alert",
            Es,
            Emergency,
            alert_vars,
            "EMERGENCIA {{upper severity}} para {{business_name}}: {{emergency_type}} en {{location}}. Llamante: {{caller_phone}}. Detalles: {{description}}",
        ),
        (
            "emergency_escalation",
            En,
            Emergency,
            escalation_vars,
            "{{contact_name}}, you are on call for {{business_name}}. {{emergency_type}} reported at {{location}}. Call {{caller_phone}} now.",
        ),
        (
            "emergency_escalation",
            Es,
            Emergency,
            escalation_vars,
            "{{contact_name}}, usted está de guardia para {{business_name}}. Se reportó {{emergency_type}} en {{location}}. Llame a {{caller_phone}} ahora.",
        ),
        (
            "follow_up",
            En,
            FollowUp,
            follow_up_vars,
            "Hi {{customer_name}}, thanks for choosing {{business_name}} for your {{service_type}}. Reply HELP if anything isn't right.",
        ),
        (
            "follow_up",
            Es,
            FollowUp,
            follow_up_vars,
            "Hola {{customer_name}}, gracias por elegir a {{business_name}} para su {{service_type}}. Responda AYUDA si algo no está bien.",
        ),
        (
            "survey",
            En,
            Survey,
            survey_vars,
            "How did we do? Reply with a rating from 1 to 5 for your recent visit from {{business_name}}.",
        ),
        (
            "survey",
            Es,
            Survey,
            survey_vars,
            "¿Cómo lo hicimos? Responda con una calificación del 1 al 5 sobre su visita reciente de {{business_name}}.",
        ),
    ];

    let now = Utc::now();
    definitions
        .into_iter()
        .map(|(key, language, category, variables, content)| NotificationTemplate {
            id: Uuid::new_v4(),
            organization_id: None,
            template_key: key.to_string(),
            language,
            content: content.to_string(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
            category,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        })
        .collect()
}
