use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::digest::Output;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const FLAG_HEX_LEN: usize = 32;

/// Derive the flag for a (game, team, tick).
///
/// The value depends only on its inputs, so minting twice yields the same
/// flag, and it can't be predicted without the game secret.
pub fn generate_flag(
  secret: impl AsRef<[u8]>,
  game_id: i64,
  team_id: i64,
  tick: i64,
) -> Result<String> {
  let mut mac = HmacSha256::new_from_slice(secret.as_ref())
    .map_err(|err| anyhow!("invalid flag key: {}", err))?;
  mac.update(format!("{}:{}:{}", game_id, team_id, tick).as_bytes());
  let digest = format!("{:x}", mac.finalize().into_bytes());
  Ok(format!("FLAG{{{}}}", &digest[..FLAG_HEX_LEN]))
}

/// A fresh random per-game secret, hex encoded.
pub fn generate_secret() -> String {
  let mut bytes = Output::<Sha256>::default();
  rand::thread_rng().fill_bytes(&mut bytes);
  format!("{:x}", bytes)
}
