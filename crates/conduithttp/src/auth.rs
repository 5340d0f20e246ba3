use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// How a client authenticates. Produces the headers added to every request.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStrategy {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        #[serde(rename = "accessToken")]
        access_token: String,
        #[serde(rename = "tokenType", default = "default_token_type")]
        token_type: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl AuthStrategy {
    pub fn bearer(token: impl Into<String>) -> Self {
        AuthStrategy::Bearer {
            token: token.into(),
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthStrategy::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn api_key(header: impl Into<String>, key: impl Into<String>) -> Self {
        AuthStrategy::ApiKey {
            header: header.into(),
            key: key.into(),
        }
    }

    pub fn oauth2(access_token: impl Into<String>) -> Self {
        AuthStrategy::OAuth2 {
            access_token: access_token.into(),
            token_type: default_token_type(),
        }
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            AuthStrategy::None => Vec::new(),
            AuthStrategy::Bearer { token } => {
                vec![("Authorization".to_string(), format!("Bearer {}", token))]
            }
            AuthStrategy::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{}:{}", username, password));
                vec![("Authorization".to_string(), format!("Basic {}", encoded))]
            }
            AuthStrategy::ApiKey { header, key } => vec![(header.clone(), key.clone())],
            AuthStrategy::OAuth2 {
                access_token,
                token_type,
            } => vec![(
                "Authorization".to_string(),
                format!("{} {}", token_type, access_token),
            )],
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AuthStrategy::None => "none",
            AuthStrategy::Bearer { .. } => "bearer",
            AuthStrategy::Basic { .. } => "basic",
            AuthStrategy::ApiKey { .. } => "api_key",
            AuthStrategy::OAuth2 { .. } => "oauth2",
        }
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthStrategy({})", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_auth_is_base64() {
        let headers = AuthStrategy::basic("ada", "lovelace").headers();
        assert_eq!(
            headers,
            vec![("Authorization".to_string(), "Basic YWRhOmxvdmVsYWNl".to_string())]
        );
    }

    #[test]
    fn parses_tagged_config() {
        let auth: AuthStrategy =
            serde_json::from_value(json!({"type": "oauth2", "accessToken": "abc"})).unwrap();
        assert_eq!(
            auth.headers(),
            vec![("Authorization".to_string(), "Bearer abc".to_string())]
        );

        let auth: AuthStrategy =
            serde_json::from_value(json!({"type": "api_key", "key": "k1"})).unwrap();
        assert_eq!(auth.headers(), vec![("X-API-Key".to_string(), "k1".to_string())]);
    }

    #[test]
    fn debug_hides_secrets() {
        let auth = AuthStrategy::bearer("super-secret");
        assert_eq!(format!("{:?}", auth), "AuthStrategy(bearer)");
    }
}
