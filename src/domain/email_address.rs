use validator::ValidateEmail;

#[derive(Debug, Clone)]
/// A syntactically valid e-mail address. Used for both senders and
/// recipients wherever an address crosses a component boundary.
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(address: String) -> Result<Self, String> {
        ValidateEmail::validate_email(&address)
            .then_some(Self(address.clone()))
            .ok_or(format!("Invalid email address: {address:?}"))
    }

    /// The part after the final `@`, lowercased.
    pub fn domain(&self) -> String {
        self.0.rsplit('@').next().unwrap_or_default().to_lowercase()
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
