//! 공유 비밀 challenge 인증
//!
//! 서버가 64바이트 난수를 보내면 클라이언트는 `hash(challenge XOR secret)`을
//! 돌려준다. 비밀을 알고 있다는 것만 증명하며 페이로드를 보호하지는 않는다.

use rand::rngs::OsRng;
use rand::RngCore;

/// challenge 크기 (바이트)
pub const CHALLENGE_SIZE: usize = 64;

/// 새 challenge 생성
pub fn generate_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// 짧은 쪽 길이까지 바이트 단위 XOR
pub fn xor_secret(challenge: &[u8], secret: &[u8]) -> Vec<u8> {
    challenge
        .iter()
        .zip(secret.iter())
        .map(|(c, s)| c ^ s)
        .collect()
}

/// challenge 응답 계산 (BLAKE3)
pub fn digest(challenge: &[u8], secret: &str) -> Vec<u8> {
    let mixed = xor_secret(challenge, secret.as_bytes());
    blake3::hash(&mixed).as_bytes().to_vec()
}

/// 클라이언트 응답 검증 (길이 또는 바이트 하나라도 다르면 실패)
pub fn verify(challenge: &[u8], secret: &str, response: &[u8]) -> bool {
    let expected = digest(challenge, secret);
    expected.len() == response.len() && expected.iter().zip(response).all(|(a, b)| a == b)
}
