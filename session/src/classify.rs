use common::model::events::FailureReason;

/// SteamGuard 误报对应的 eresult
const ERESULT_STEAM_GUARD: [i32; 2] = [63, 65];
/// 登录限流
const ERESULT_RATE_LIMIT: [i32; 2] = [84, 87];
/// 密码错误 / 二步验证失败，终止性
const ERESULT_AUTH: [i32; 2] = [61, 66];

const PROXY_ERROR_MARKERS: [&str; 7] = [
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "proxy",
    "500 internal server error",
    "self-signed certificate",
];

/// 把上游错误归入监督器的重试类别
pub fn classify_login_failure(eresult: Option<i32>, message: &str) -> FailureReason {
    if let Some(code) = eresult {
        if ERESULT_STEAM_GUARD.contains(&code) {
            return FailureReason::SteamGuard;
        }
        if ERESULT_RATE_LIMIT.contains(&code) {
            return FailureReason::RateLimit;
        }
        if ERESULT_AUTH.contains(&code) {
            return FailureReason::Auth;
        }
    }

    let lower = message.to_lowercase();
    if lower.contains("ratelimitexceeded") || lower.contains("accountlogindeniedthrottle") {
        return FailureReason::RateLimit;
    }
    if PROXY_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureReason::Proxy;
    }

    FailureReason::Other
}
