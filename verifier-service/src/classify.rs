//! Canonical verdict computation. A pure function of its inputs: identical
//! `(mx, catch_all, smtp, fallback, delivery)` observations always produce
//! the identical `(verify_status, verify_reason)` pair.

use common_store::{CatchAllStatus, FallbackStatus, VerifyStatus};

use crate::smtp::ProbeCategory;

#[derive(Debug, Clone, PartialEq)]
pub struct SmtpObservation {
    pub category: ProbeCategory,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifierInput {
    pub no_mx: bool,
    pub catch_all: Option<CatchAllStatus>,
    pub smtp: Option<SmtpObservation>,
    pub fallback: Option<FallbackStatus>,
    pub delivery_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: VerifyStatus,
    pub reason: String,
}

impl Verdict {
    fn new(status: VerifyStatus, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into() }
    }
}

/// The classification rules, applied in order. See each arm's reason code
/// for the rule it implements.
pub fn classify(input: &ClassifierInput) -> Verdict {
    // 1. No MX: nothing can ever be delivered there.
    if input.no_mx {
        return Verdict::new(VerifyStatus::Invalid, "no_mx");
    }

    // 2. Confirmed catch-all: an accept proves nothing. Only an actual
    //    prior delivery to this exact address upgrades the verdict.
    if input.catch_all == Some(CatchAllStatus::CatchAll) {
        return if input.delivery_confirmed {
            Verdict::new(VerifyStatus::Valid, "delivered_on_catchall")
        } else {
            Verdict::new(VerifyStatus::RiskyCatchAll, "catch_all_domain")
        };
    }

    // 3. The SMTP probe outcome, where one ran.
    if let Some(smtp) = &input.smtp {
        match smtp.category {
            ProbeCategory::Accept => {
                // 4. An accept with an unsettled catch-all probe cannot be
                //    distinguished from a catch-all accept; stay conservative.
                let catchall_unsettled = matches!(
                    input.catch_all,
                    Some(CatchAllStatus::TempFail) | Some(CatchAllStatus::Error) | None
                );
                if catchall_unsettled {
                    return Verdict::new(
                        VerifyStatus::RiskyCatchAll,
                        "catchall_unknown_rcpt_2xx",
                    );
                }
                return Verdict::new(VerifyStatus::Valid, "rcpt_2xx_non_catchall");
            }
            ProbeCategory::HardFail => {
                return Verdict::new(VerifyStatus::Invalid, "rcpt_5xx");
            }
            ProbeCategory::TempFail | ProbeCategory::Unknown => {
                if let Some(fallback) = input.fallback {
                    return match fallback {
                        FallbackStatus::Deliverable => {
                            Verdict::new(VerifyStatus::Valid, "fallback_deliverable")
                        }
                        FallbackStatus::Undeliverable => {
                            Verdict::new(VerifyStatus::Invalid, "fallback_undeliverable")
                        }
                        FallbackStatus::Unknown => {
                            Verdict::new(VerifyStatus::UnknownTimeout, "fallback_unknown")
                        }
                    };
                }
                let reason = smtp
                    .reason
                    .clone()
                    .unwrap_or_else(|| smtp.category.as_str().to_string());
                return Verdict::new(VerifyStatus::UnknownTimeout, reason);
            }
        }
    }

    // No probe ran (disabled, or skipped without a catch-all verdict).
    Verdict::new(VerifyStatus::UnknownTimeout, "no_probe")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp(category: ProbeCategory, code: u16) -> Option<SmtpObservation> {
        Some(SmtpObservation { category, code: Some(code), reason: None })
    }

    #[test]
    fn no_mx_wins_over_everything() {
        let verdict = classify(&ClassifierInput {
            no_mx: true,
            catch_all: Some(CatchAllStatus::CatchAll),
            smtp: smtp(ProbeCategory::Accept, 250),
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::Invalid, "no_mx"));
    }

    #[test]
    fn catch_all_domain_is_risky() {
        let verdict = classify(&ClassifierInput {
            catch_all: Some(CatchAllStatus::CatchAll),
            smtp: smtp(ProbeCategory::Accept, 250),
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::RiskyCatchAll, "catch_all_domain"));
    }

    #[test]
    fn delivery_confirmation_upgrades_catch_all() {
        let verdict = classify(&ClassifierInput {
            catch_all: Some(CatchAllStatus::CatchAll),
            delivery_confirmed: true,
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::Valid, "delivered_on_catchall"));
    }

    #[test]
    fn accept_on_non_catchall_is_valid() {
        let verdict = classify(&ClassifierInput {
            catch_all: Some(CatchAllStatus::NotCatchAll),
            smtp: smtp(ProbeCategory::Accept, 250),
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::Valid, "rcpt_2xx_non_catchall"));
    }

    #[test]
    fn accept_with_unsettled_catchall_stays_risky() {
        for catch_all in [Some(CatchAllStatus::TempFail), Some(CatchAllStatus::Error), None] {
            let verdict = classify(&ClassifierInput {
                catch_all,
                smtp: smtp(ProbeCategory::Accept, 250),
                ..Default::default()
            });
            assert_eq!(
                verdict,
                Verdict::new(VerifyStatus::RiskyCatchAll, "catchall_unknown_rcpt_2xx"),
                "catch_all={catch_all:?}"
            );
        }
    }

    #[test]
    fn hard_fail_is_invalid() {
        let verdict = classify(&ClassifierInput {
            catch_all: Some(CatchAllStatus::NotCatchAll),
            smtp: smtp(ProbeCategory::HardFail, 550),
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::Invalid, "rcpt_5xx"));
    }

    #[test]
    fn temp_fail_without_fallback_is_unknown_with_smtp_reason() {
        let verdict = classify(&ClassifierInput {
            catch_all: Some(CatchAllStatus::NotCatchAll),
            smtp: Some(SmtpObservation {
                category: ProbeCategory::Unknown,
                code: None,
                reason: Some("tcp25_blocked".to_string()),
            }),
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::UnknownTimeout, "tcp25_blocked"));
    }

    #[test]
    fn fallback_decides_inconclusive_probes() {
        let base = ClassifierInput {
            catch_all: Some(CatchAllStatus::NotCatchAll),
            smtp: smtp(ProbeCategory::TempFail, 451),
            ..Default::default()
        };
        let cases = [
            (FallbackStatus::Deliverable, VerifyStatus::Valid, "fallback_deliverable"),
            (FallbackStatus::Undeliverable, VerifyStatus::Invalid, "fallback_undeliverable"),
            (FallbackStatus::Unknown, VerifyStatus::UnknownTimeout, "fallback_unknown"),
        ];
        for (fallback, status, reason) in cases {
            let verdict = classify(&ClassifierInput { fallback: Some(fallback), ..base.clone() });
            assert_eq!(verdict, Verdict::new(status, reason));
        }
    }

    #[test]
    fn no_probe_at_all_is_unknown() {
        let verdict = classify(&ClassifierInput {
            catch_all: Some(CatchAllStatus::NotCatchAll),
            ..Default::default()
        });
        assert_eq!(verdict, Verdict::new(VerifyStatus::UnknownTimeout, "no_probe"));
    }

    #[test]
    fn classifier_is_pure() {
        let input = ClassifierInput {
            catch_all: Some(CatchAllStatus::TempFail),
            smtp: smtp(ProbeCategory::Accept, 250),
            ..Default::default()
        };
        let first = classify(&input);
        for _ in 0..10 {
            assert_eq!(classify(&input), first);
        }
    }
}
