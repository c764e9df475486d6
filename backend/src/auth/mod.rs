use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::{Actor, Party};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Party,
    exp: usize,
}

pub fn create_token(actor: &Actor, jwt_secret: &str) -> Result<String, Box<dyn std::error::Error>> {
    let expiration = SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_secs() as usize + 24 * 60 * 60; // 24 hours
    let claims = Claims {
        sub: actor.user_id.to_string(),
        role: actor.party,
        exp: expiration,
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(jwt_secret.as_bytes()))?;
    Ok(token)
}

pub fn validate_token(token: &str, jwt_secret: &str) -> Result<Actor, Box<dyn std::error::Error>> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(Actor {
        user_id: token_data.claims.sub.parse()?,
        party: token_data.claims.role,
    })
}
