//! Rule-based routing of operator text to a single tool call.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//! documentation phrasing, then entity + verb, then the vendor-call, pickup
//! and reminder detectors. Entity precedence is sales order, purchase order,
//! quote; text naming several entities resolves to the first of those.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

pub const SEARCH_DOCUMENTATION: &str = "search_documentation";
pub const DOCUMENTATION_RESULT_COUNT: u64 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedIntent {
    pub tool: String,
    pub args: Value,
}

impl ClassifiedIntent {
    fn new(tool: impl Into<String>, args: Value) -> Self {
        Self { tool: tool.into(), args }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusinessEntity {
    SalesOrder,
    PurchaseOrder,
    Quote,
}

impl BusinessEntity {
    /// Checked in this order; the first entity mentioned in this list wins.
    pub const PRECEDENCE: [BusinessEntity; 3] =
        [BusinessEntity::SalesOrder, BusinessEntity::PurchaseOrder, BusinessEntity::Quote];

    pub fn slug(&self) -> &'static str {
        match self {
            Self::SalesOrder => "sales_order",
            Self::PurchaseOrder => "purchase_order",
            Self::Quote => "quote",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SalesOrder => "sales order",
            Self::PurchaseOrder => "purchase order",
            Self::Quote => "quote",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Self::SalesOrder => &SALES_ORDER,
            Self::PurchaseOrder => &PURCHASE_ORDER,
            Self::Quote => &QUOTE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerbFamily {
    Create,
    Update,
    Close,
    Email,
}

impl VerbFamily {
    pub const PRECEDENCE: [VerbFamily; 4] =
        [VerbFamily::Create, VerbFamily::Update, VerbFamily::Close, VerbFamily::Email];

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Close => "close",
            Self::Email => "email",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Self::Create => &CREATE_VERBS,
            Self::Update => &UPDATE_VERBS,
            Self::Close => &CLOSE_VERBS,
            Self::Email => &EMAIL_VERBS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickupField {
    Instructions,
    Notes,
    Phone,
    Contact,
    Location,
    Time,
}

impl PickupField {
    /// More specific fields first: instructions often mention a time or place.
    pub const PRECEDENCE: [PickupField; 6] = [
        PickupField::Instructions,
        PickupField::Notes,
        PickupField::Phone,
        PickupField::Contact,
        PickupField::Location,
        PickupField::Time,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instructions => "instructions",
            Self::Notes => "notes",
            Self::Phone => "phone",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Time => "time",
        }
    }

    pub fn tool_name(&self) -> String {
        format!("update_pickup_{}", self.as_str())
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Self::Instructions => &PICKUP_INSTRUCTIONS,
            Self::Notes => &PICKUP_NOTES,
            Self::Phone => &PICKUP_PHONE,
            Self::Contact => &PICKUP_CONTACT,
            Self::Location => &PICKUP_LOCATION,
            Self::Time => &PICKUP_TIME,
        }
    }
}

static DOCUMENTATION: Lazy<Regex> = Lazy::new(|| {
    word_pattern(
        r"docs?|documentation|manual|how (?:do|can|should) (?:i|we)|how to|steps to|walk me through|where can i find",
    )
});

static SALES_ORDER: Lazy<Regex> = Lazy::new(|| word_pattern(r"sales[ -]orders?|so"));
static PURCHASE_ORDER: Lazy<Regex> = Lazy::new(|| word_pattern(r"purchase[ -]orders?|po"));
static QUOTE: Lazy<Regex> = Lazy::new(|| word_pattern(r"quotes?|quotation"));

static CREATE_VERBS: Lazy<Regex> = Lazy::new(|| {
    word_pattern(r"create|new|make|open|start|raise|draft|add|need|generate|place|set up")
});
static UPDATE_VERBS: Lazy<Regex> =
    Lazy::new(|| word_pattern(r"update|change|modify|edit|amend|adjust|revise"));
static CLOSE_VERBS: Lazy<Regex> =
    Lazy::new(|| word_pattern(r"close|complete|finish|finali[sz]e|cancel|void|archive"));
static EMAIL_VERBS: Lazy<Regex> = Lazy::new(|| word_pattern(r"e-?mail|send|mail|forward"));

static CALL: Lazy<Regex> = Lazy::new(|| word_pattern(r"call|calls|calling|phone call"));
static VENDOR: Lazy<Regex> = Lazy::new(|| word_pattern(r"vendors?|suppliers?"));
static CALL_STATUS: Lazy<Regex> =
    Lazy::new(|| word_pattern(r"status|progress|result|results|outcome|how did"));
static CALL_SEND: Lazy<Regex> =
    Lazy::new(|| word_pattern(r"send|e-?mail|follow[- ]?up|recap"));

static PICKUP: Lazy<Regex> = Lazy::new(|| word_pattern(r"pick[- ]?ups?"));
static PICKUP_INSTRUCTIONS: Lazy<Regex> =
    Lazy::new(|| word_pattern(r"instructions?|directions"));
static PICKUP_NOTES: Lazy<Regex> = Lazy::new(|| word_pattern(r"notes?|comments?"));
static PICKUP_PHONE: Lazy<Regex> = Lazy::new(|| word_pattern(r"phone|tel|mobile|cell"));
static PICKUP_CONTACT: Lazy<Regex> = Lazy::new(|| word_pattern(r"contact|contact person"));
static PICKUP_LOCATION: Lazy<Regex> =
    Lazy::new(|| word_pattern(r"location|address|where|dock|site"));
static PICKUP_TIME: Lazy<Regex> = Lazy::new(|| word_pattern(r"time|date|when|window"));
static PICKUP_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bto\b|\bis\b|\bas\b|:)\s*(?P<value>.+?)\s*$")
        .expect("pickup value pattern is valid")
});

static REMINDER: Lazy<Regex> = Lazy::new(|| {
    word_pattern(r"remind(?: me)?|reminder|follow[- ]?up|to-?do|don't forget|do not forget")
});

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\b(?P<prefixed>[a-z]{1,4}-\d{2,})\b|#(?P<hashed>\d+)\b|\b(?P<bare>\d{3,})\b)")
        .expect("reference pattern is valid")
});
static EMAIL_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
        .expect("email pattern is valid")
});

/// Case-insensitive alternation anchored on word boundaries, so `po` never
/// matches inside `polo` or `deposit`.
fn word_pattern(alternation: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("classifier pattern is valid")
}

#[derive(Clone, Debug, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> Option<ClassifiedIntent> {
        classify(text)
    }
}

pub fn classify(text: &str) -> Option<ClassifiedIntent> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if DOCUMENTATION.is_match(text) {
        return Some(ClassifiedIntent::new(
            SEARCH_DOCUMENTATION,
            json!({ "query": text, "k": DOCUMENTATION_RESULT_COUNT }),
        ));
    }

    if let Some(intent) = classify_business_action(text) {
        return Some(intent);
    }

    classify_vendor_call(text)
        .or_else(|| classify_pickup(text))
        .or_else(|| classify_reminder(text))
}

/// First entity in precedence order that is mentioned, regardless of verbs.
pub fn detect_entity(text: &str) -> Option<BusinessEntity> {
    BusinessEntity::PRECEDENCE.into_iter().find(|entity| entity.pattern().is_match(text))
}

pub fn detect_verb(text: &str) -> Option<VerbFamily> {
    VerbFamily::PRECEDENCE.into_iter().find(|verb| verb.pattern().is_match(text))
}

fn classify_business_action(text: &str) -> Option<ClassifiedIntent> {
    let entity = detect_entity(text)?;
    let verb = detect_verb(text)?;

    let mut args = Map::new();
    args.insert("request".to_string(), Value::from(text));
    if let Some(reference) = extract_reference(text) {
        args.insert("reference".to_string(), Value::from(reference));
    }
    if verb == VerbFamily::Email {
        if let Some(recipient) = extract_email(text) {
            args.insert("recipient".to_string(), Value::from(recipient));
        }
    }

    Some(ClassifiedIntent::new(format!("{}_{}", verb.prefix(), entity.slug()), Value::Object(args)))
}

fn classify_vendor_call(text: &str) -> Option<ClassifiedIntent> {
    if !CALL.is_match(text) || !VENDOR.is_match(text) {
        return None;
    }

    let tool = if CALL_STATUS.is_match(text) {
        "poll_vendor_call"
    } else if CALL_SEND.is_match(text) {
        "send_vendor_call_email"
    } else {
        "start_vendor_call"
    };

    let mut args = Map::new();
    args.insert("request".to_string(), Value::from(text));
    if let Some(reference) = extract_reference(text) {
        args.insert("reference".to_string(), Value::from(reference));
    }
    Some(ClassifiedIntent::new(tool, Value::Object(args)))
}

fn classify_pickup(text: &str) -> Option<ClassifiedIntent> {
    if !PICKUP.is_match(text) {
        return None;
    }

    let (field, field_end) = PickupField::PRECEDENCE
        .into_iter()
        .find_map(|field| field.pattern().find(text).map(|found| (field, found.end())))?;

    let value = PICKUP_VALUE
        .captures(&text[field_end..])
        .and_then(|captures| captures.name("value"))
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| text.to_string());

    let mut args = Map::new();
    args.insert("value".to_string(), Value::from(value));
    if let Some(reference) = extract_reference(text) {
        args.insert("reference".to_string(), Value::from(reference));
    }
    Some(ClassifiedIntent::new(field.tool_name(), Value::Object(args)))
}

fn classify_reminder(text: &str) -> Option<ClassifiedIntent> {
    if !REMINDER.is_match(text) {
        return None;
    }
    Some(ClassifiedIntent::new("create_task", json!({ "title": text, "body": text })))
}

/// Document number such as `SO-1001`, `#42` or a bare `10045`.
pub fn extract_reference(text: &str) -> Option<String> {
    let captures = REFERENCE.captures(text)?;
    captures
        .name("prefixed")
        .map(|value| value.as_str().to_ascii_uppercase())
        .or_else(|| captures.name("hashed").map(|value| value.as_str().to_string()))
        .or_else(|| captures.name("bare").map(|value| value.as_str().to_string()))
}

pub fn extract_email(text: &str) -> Option<String> {
    EMAIL_ADDRESS.find(text).map(|found| found.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{classify, detect_entity, extract_reference, BusinessEntity, SEARCH_DOCUMENTATION};

    fn tool_for(text: &str) -> Option<String> {
        classify(text).map(|intent| intent.tool)
    }

    #[test]
    fn documentation_phrasing_preempts_business_actions() {
        let intent = classify("How do I create a sales order?").expect("documentation intent");
        assert_eq!(intent.tool, SEARCH_DOCUMENTATION);
        assert_eq!(intent.args, json!({ "query": "How do I create a sales order?", "k": 5 }));

        assert_eq!(tool_for("walk me through closing a PO").as_deref(), Some(SEARCH_DOCUMENTATION));
        assert_eq!(tool_for("where are the docs for quotes").as_deref(), Some(SEARCH_DOCUMENTATION));
    }

    #[test]
    fn entity_mentions_require_whole_words() {
        assert_eq!(tool_for("I need a po").as_deref(), Some("create_purchase_order"));
        assert_eq!(tool_for("I like polo shirts"), None);
        assert_eq!(detect_entity("please polish the deposit"), None);
        assert_eq!(detect_entity("the PO is late"), Some(BusinessEntity::PurchaseOrder));
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(tool_for("CREATE A NEW QUOTE").as_deref(), Some("create_quote"));
        assert_eq!(tool_for("Update Sales Order SO-1001").as_deref(), Some("update_sales_order"));
    }

    #[test]
    fn sales_order_wins_when_several_entities_are_named() {
        assert_eq!(
            tool_for("create a sales order from quote Q-17").as_deref(),
            Some("create_sales_order")
        );
        assert_eq!(
            tool_for("close the purchase order and the quote").as_deref(),
            Some("close_purchase_order")
        );
    }

    #[test]
    fn verb_families_are_checked_in_order() {
        assert_eq!(tool_for("email the new quote").as_deref(), Some("create_quote"));
        assert_eq!(tool_for("cancel PO-88").as_deref(), Some("close_purchase_order"));
        assert_eq!(tool_for("send quote 1042").as_deref(), Some("email_quote"));
        assert_eq!(tool_for("what about the sales order"), None);
    }

    #[test]
    fn business_args_carry_reference_and_recipient() {
        let intent = classify("email quote Q-1042 to buyer@acme.example").expect("email intent");
        assert_eq!(intent.tool, "email_quote");
        assert_eq!(
            intent.args,
            json!({
                "request": "email quote Q-1042 to buyer@acme.example",
                "reference": "Q-1042",
                "recipient": "buyer@acme.example",
            })
        );
    }

    #[test]
    fn vendor_call_lifecycle_is_disambiguated() {
        assert_eq!(tool_for("call the vendor about pricing").as_deref(), Some("start_vendor_call"));
        assert_eq!(
            tool_for("what's the status of the vendor call").as_deref(),
            Some("poll_vendor_call")
        );
        assert_eq!(
            tool_for("send the vendor call recap").as_deref(),
            Some("send_vendor_call_email")
        );
    }

    #[test]
    fn pickup_fields_map_to_partial_updates() {
        let intent = classify("set the pickup time to 3pm Friday").expect("pickup intent");
        assert_eq!(intent.tool, "update_pickup_time");
        assert_eq!(intent.args, json!({ "value": "3pm Friday" }));

        let intent =
            classify("pickup instructions: ring when at the dock").expect("instructions intent");
        assert_eq!(intent.tool, "update_pickup_instructions");
        assert_eq!(intent.args["value"], json!("ring when at the dock"));

        assert_eq!(
            tool_for("pickup phone for 20451 is 555-0100").as_deref(),
            Some("update_pickup_phone")
        );
        assert_eq!(tool_for("pickup is fine"), None);
    }

    #[test]
    fn reminders_become_generic_tasks() {
        let intent = classify("remind me to chase Acme on Monday").expect("reminder intent");
        assert_eq!(intent.tool, "create_task");
        assert_eq!(
            intent.args,
            json!({
                "title": "remind me to chase Acme on Monday",
                "body": "remind me to chase Acme on Monday",
            })
        );
    }

    #[test]
    fn unmatched_text_is_a_routing_miss() {
        assert_eq!(tool_for("good morning"), None);
        assert_eq!(tool_for("   "), None);
    }

    #[test]
    fn references_are_normalized() {
        assert_eq!(extract_reference("so-1001 please").as_deref(), Some("SO-1001"));
        assert_eq!(extract_reference("order #42").as_deref(), Some("42"));
        assert_eq!(extract_reference("po 10045").as_deref(), Some("10045"));
        assert_eq!(extract_reference("no number here"), None);
    }
}
