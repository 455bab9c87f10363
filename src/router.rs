use crate::configuration::RoutingSettings;
use crate::domain::Category;

/// Static category-to-mailbox table, plus the consolidation-bin override
/// applied to every fallback destination.
pub struct Router {
    routing: RoutingSettings,
    consolidation_bin: String,
}

impl Router {
    pub fn new(
        routing: RoutingSettings,
        consolidation_bin: String,
    ) -> Self {
        Self {
            routing,
            consolidation_bin,
        }
    }

    /// Destination mailbox for a classified category. `None` when the
    /// label is outside the taxonomy; the caller falls back to the
    /// original recipient.
    pub fn route(
        &self,
        category_label: &str,
    ) -> Option<&str> {
        let destination = match Category::parse(category_label)? {
            Category::Amendments => &self.routing.policy_services,
            Category::Assist => &self.routing.policy_services,
            Category::VehicleTracking => &self.routing.tracking,
            Category::BadService => &self.routing.policy_services,
            Category::Claims => &self.routing.claims,
            Category::RefundRequest => &self.routing.policy_services,
            Category::DocumentRequest => &self.routing.online_support,
            Category::OnlineApp => &self.routing.online_support,
            Category::Retentions => &self.routing.digital_comms,
            Category::RequestForQuote => &self.routing.policy_services,
            Category::DebitOrderSwitch => &self.routing.online_support,
            Category::PreviousInsurance => &self.routing.insurance_admin,
            Category::Other => &self.routing.policy_services,
        };
        Some(destination)
    }

    /// Fallback destination: the original recipient, unless that is the
    /// consolidation bin itself, which would forward the message straight
    /// back into the queue. Policy services takes those.
    pub fn fallback_destination(
        &self,
        original_to: &str,
    ) -> String {
        if original_to.eq_ignore_ascii_case(&self.consolidation_bin) {
            self.routing.policy_services.clone()
        } else {
            original_to.to_string()
        }
    }
}
