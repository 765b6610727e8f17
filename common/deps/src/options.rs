use std::fmt;
use std::str::FromStr;

use tracing::Span;

/// Deployment environment an application runs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Env {
    #[default]
    Dev,
    Test,
    Staging,
    Production,
}

impl Env {
    pub fn as_str(&self) -> &'static str {
        match self {
            Env::Dev => "dev",
            Env::Test => "test",
            Env::Staging => "staging",
            Env::Production => "production",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvError(pub String);

impl fmt::Display for ParseEnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown environment: {}, must be one of dev, test, staging, production",
            self.0
        )
    }
}

impl std::error::Error for ParseEnvError {}

impl FromStr for Env {
    type Err = ParseEnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "dev" | "development" => Ok(Env::Dev),
            "test" => Ok(Env::Test),
            "staging" | "stage" => Ok(Env::Staging),
            "production" | "prod" => Ok(Env::Production),
            _ => Err(ParseEnvError(s.to_owned())),
        }
    }
}

/// Immutable configuration handed to a dependency's resolver.
///
/// The span doubles as the dependency's logger: resolvers can enter it, or attach it
/// to the futures they spawn, so their events carry the dependency's fields.
#[derive(Clone, Debug)]
pub struct DepOptions {
    name: String,
    env: Env,
    singleton: bool,
    span: Span,
}

impl DepOptions {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            env: Env::default(),
            singleton: false,
            span: Span::current(),
        }
    }

    /// Logical name of the owning application, passed through to resolvers.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    /// Cache the first successfully resolved instance and hand out clones of it.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> Env {
        self.env
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for DepOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_from_str() {
        assert_eq!("dev".parse::<Env>().unwrap(), Env::Dev);
        assert_eq!("TEST".parse::<Env>().unwrap(), Env::Test);
        assert_eq!("staging".parse::<Env>().unwrap(), Env::Staging);
        assert_eq!(" production ".parse::<Env>().unwrap(), Env::Production);
        assert_eq!("prod".parse::<Env>().unwrap(), Env::Production);
        assert!("qa".parse::<Env>().is_err());
    }

    #[test]
    fn options_builder() {
        let opts = DepOptions::new()
            .with_name("billing")
            .with_env(Env::Staging)
            .singleton();
        assert_eq!(opts.name(), "billing");
        assert_eq!(opts.env(), Env::Staging);
        assert!(opts.is_singleton());
        assert!(!DepOptions::default().is_singleton());
    }
}
