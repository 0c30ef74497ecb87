use crate::config::ContactSettings;
use crate::intent::BusinessKind;

pub const PARTNERSHIP_CONFIDENCE: f64 = 10.0;
pub const TECHNICAL_SUPPORT_CONFIDENCE: f64 = 9.0;
pub const TRADE_SECRET_CONFIDENCE: f64 = 9.0;
pub const DOSAGE_FALLBACK_CONFIDENCE: f64 = 7.0;
pub const DOSAGE_FALLBACK_REASON: &str = "dosage fallback: packaging instructions";

/// Short phrase telling the reader how to reach a person, e.g. for the end
/// of a generated answer.
pub fn contact_reference(contact: &ContactSettings) -> String {
    match (contact.support_phone.as_deref(), contact.support_url.as_deref()) {
        (Some(phone), Some(url)) => format!("call {phone} or visit {url}"),
        (Some(phone), None) => format!("call {phone}"),
        (None, Some(url)) => format!("contact {} at {url}", contact.company_name),
        (None, None) => format!("reach {}'s support team", contact.company_name),
    }
}

pub fn contact_block(contact: &ContactSettings) -> String {
    let mut lines = Vec::new();
    if let Some(phone) = contact.support_phone.as_deref() {
        match contact.support_hours.as_deref() {
            Some(hours) => lines.push(format!("Phone: {phone} ({hours})")),
            None => lines.push(format!("Phone: {phone}")),
        }
    }
    if let Some(url) = contact.support_url.as_deref() {
        lines.push(format!("Contact form: {url}"));
    }
    if lines.is_empty() {
        lines.push(format!("Please contact {}'s support team.", contact.company_name));
    }
    lines.join("\n")
}

/// Fixed response texts. None of them carry retrieved content.
#[derive(Debug, Clone)]
pub struct Templates {
    contact: ContactSettings,
}

impl Templates {
    pub fn new(contact: ContactSettings) -> Self {
        Self { contact }
    }

    pub fn contact(&self) -> &ContactSettings {
        &self.contact
    }

    pub fn business(&self, kind: BusinessKind) -> String {
        match kind {
            BusinessKind::Partnership => self.partnership(),
            BusinessKind::TechnicalSupport => self.technical_support(),
        }
    }

    pub fn partnership(&self) -> String {
        format!(
            "Thank you for your interest in working with {}.\n\n\
             Our partnership team handles distribution, wholesale and dealer enquiries \
             directly and will be glad to walk you through the terms.\n\n\
             {}\n\n\
             Partners receive product training, technical support and marketing materials.",
            self.contact.company_name,
            contact_block(&self.contact)
        )
    }

    pub fn technical_support(&self) -> String {
        format!(
            "Thank you for contacting {}.\n\n\
             Our technical support specialists can help diagnose this directly.\n\n\
             {}\n\n\
             Please have ready: tank volume, current water parameters, the products you use \
             and a short description of the problem.",
            self.contact.company_name,
            contact_block(&self.contact)
        )
    }

    pub fn trade_secret(&self) -> String {
        format!(
            "Thanks for asking about how our products are made.\n\n\
             Production details such as formulas, exact ingredients and manufacturing methods \
             are trade secrets, so I can't share them.\n\n\
             What I can say is that every batch goes through quality control before release.\n\n\
             For technical questions about using a product:\n{}",
            contact_block(&self.contact)
        )
    }

    pub fn dosage_fallback(&self) -> String {
        format!(
            "I couldn't find detailed dosing information for this in the knowledge base.\n\n\
             Dosing instructions are printed on the product packaging:\n\
             - always check the label before use\n\
             - start with the lowest recommended dose\n\
             - test your water parameters after dosing and adjust gradually\n\n\
             If you're unsure, our team can advise:\n{}",
            contact_block(&self.contact)
        )
    }

    pub fn escalation(&self) -> String {
        format!(
            "Sorry, I couldn't find reliable enough information to answer this question.\n\n\
             You could ask again with more detail, check the product packaging, \
             or ask our specialists directly:\n{}",
            contact_block(&self.contact)
        )
    }
}
