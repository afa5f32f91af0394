//! Entity verification lifecycle.
//!
//! `unverified -> documents_submitted -> polling_open -> verified | rejected`,
//! with `rejected -> unverified` only through an explicit resubmission. The
//! machine is a pure function of events; the poll tracks all timing.

use crate::error::{EngineError, EngineResult};
use crate::schema::{DocumentSet, EntityKind, VerificationState};

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    DocumentsUploaded(DocumentSet),
    DocumentsConfirmed { confirmed: bool },
    PollCompleted { positive: bool, quorum_met: bool },
    Resubmitted,
}

impl VerificationEvent {
    fn action(&self) -> &'static str {
        match self {
            VerificationEvent::DocumentsUploaded(_) => "upload documents",
            VerificationEvent::DocumentsConfirmed { .. } => "confirm documents",
            VerificationEvent::PollCompleted { .. } => "complete verification poll",
            VerificationEvent::Resubmitted => "resubmit",
        }
    }
}

/// Follow-up the caller has to perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    OpenVerificationPoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: VerificationState,
    pub to: VerificationState,
    pub effect: Effect,
}

pub fn apply(
    subject: &str,
    state: VerificationState,
    event: &VerificationEvent,
) -> EngineResult<Transition> {
    use VerificationState::*;

    let (to, effect) = match (state, event) {
        (Unverified, VerificationEvent::DocumentsUploaded(_)) => (DocumentsSubmitted, Effect::None),
        (DocumentsSubmitted, VerificationEvent::DocumentsConfirmed { confirmed: true }) => {
            (PollingOpen, Effect::OpenVerificationPoll)
        }
        (DocumentsSubmitted, VerificationEvent::DocumentsConfirmed { confirmed: false }) => {
            (Unverified, Effect::None)
        }
        (
            PollingOpen,
            VerificationEvent::PollCompleted {
                positive,
                quorum_met,
            },
        ) => {
            if *positive && *quorum_met {
                (Verified, Effect::None)
            } else {
                (Rejected, Effect::None)
            }
        }
        (Rejected, VerificationEvent::Resubmitted) => (Unverified, Effect::None),
        (state, event) => return Err(EngineError::conflict(subject, event.action(), state)),
    };

    Ok(Transition {
        from: state,
        to,
        effect,
    })
}

/// Documents must match the entity kind and every field must be usable.
pub fn validate_documents(documents: &DocumentSet, kind: EntityKind) -> EngineResult<()> {
    if documents.entity_kind() != kind {
        return Err(EngineError::validation(format!(
            "{} documents submitted for a {kind}",
            documents.entity_kind()
        )));
    }
    match documents {
        DocumentSet::Official {
            employee_id,
            domain_email,
        } => {
            require("employee_id", employee_id)?;
            require("domain_email", domain_email)?;
            let valid_email = domain_email
                .split_once('@')
                .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'));
            if !valid_email {
                return Err(EngineError::validation(format!(
                    "domain_email is not an email address: {domain_email}"
                )));
            }
        }
        DocumentSet::Contractor {
            registration_number,
            gst_number,
            pan,
        } => {
            require("registration_number", registration_number)?;
            require_alphanumeric("gst_number", gst_number, 15)?;
            require_alphanumeric("pan", pan, 10)?;
        }
    }
    Ok(())
}

fn require(field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    Ok(())
}

fn require_alphanumeric(field: &str, value: &str, len: usize) -> EngineResult<()> {
    require(field, value)?;
    let value = value.trim();
    if value.len() != len || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::validation(format!(
            "{field} must be {len} alphanumeric characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use VerificationState::*;

    fn official_docs() -> DocumentSet {
        DocumentSet::Official {
            employee_id: "MCD-4471".to_string(),
            domain_email: "rajesh.kumar@mcd.gov.in".to_string(),
        }
    }

    fn contractor_docs() -> DocumentSet {
        DocumentSet::Contractor {
            registration_number: "U45200DL2010PTC123456".to_string(),
            gst_number: "07AABCA1234F1Z5".to_string(),
            pan: "AABCA1234F".to_string(),
        }
    }

    #[test]
    fn happy_path_to_verified() {
        let t = apply("official-001", Unverified, &VerificationEvent::DocumentsUploaded(official_docs())).unwrap();
        assert_eq!(t.to, DocumentsSubmitted);

        let t = apply("official-001", t.to, &VerificationEvent::DocumentsConfirmed { confirmed: true }).unwrap();
        assert_eq!(t.to, PollingOpen);
        assert_eq!(t.effect, Effect::OpenVerificationPoll);

        let t = apply(
            "official-001",
            t.to,
            &VerificationEvent::PollCompleted {
                positive: true,
                quorum_met: true,
            },
        )
        .unwrap();
        assert_eq!(t.to, Verified);
    }

    #[test]
    fn negative_or_quorumless_poll_rejects() {
        for (positive, quorum_met) in [(false, true), (true, false), (false, false)] {
            let t = apply(
                "x",
                PollingOpen,
                &VerificationEvent::PollCompleted {
                    positive,
                    quorum_met,
                },
            )
            .unwrap();
            assert_eq!(t.to, Rejected);
        }
    }

    #[test]
    fn unconfirmed_documents_return_to_unverified() {
        let t = apply("x", DocumentsSubmitted, &VerificationEvent::DocumentsConfirmed { confirmed: false }).unwrap();
        assert_eq!(t.to, Unverified);
        assert_eq!(t.effect, Effect::None);
    }

    #[test]
    fn rejected_reopens_only_on_resubmission() {
        assert_eq!(apply("x", Rejected, &VerificationEvent::Resubmitted).unwrap().to, Unverified);
        let err = apply("x", Rejected, &VerificationEvent::DocumentsConfirmed { confirmed: true }).unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[test]
    fn verified_is_sticky() {
        let events = [
            VerificationEvent::DocumentsUploaded(official_docs()),
            VerificationEvent::DocumentsConfirmed { confirmed: true },
            VerificationEvent::PollCompleted {
                positive: false,
                quorum_met: true,
            },
            VerificationEvent::Resubmitted,
        ];
        for event in &events {
            assert!(apply("x", Verified, event).unwrap_err().is_state_conflict());
        }
    }

    #[test]
    fn documents_validation() {
        assert!(validate_documents(&official_docs(), EntityKind::Official).is_ok());
        assert!(validate_documents(&contractor_docs(), EntityKind::Contractor).is_ok());
        assert!(validate_documents(&official_docs(), EntityKind::Contractor).is_err());

        let bad_email = DocumentSet::Official {
            employee_id: "MCD-4471".to_string(),
            domain_email: "not-an-email".to_string(),
        };
        assert!(validate_documents(&bad_email, EntityKind::Official).is_err());

        let short_pan = DocumentSet::Contractor {
            registration_number: "U45200DL2010PTC123456".to_string(),
            gst_number: "07AABCA1234F1Z5".to_string(),
            pan: "AABCA".to_string(),
        };
        let err = validate_documents(&short_pan, EntityKind::Contractor).unwrap_err();
        assert!(err.to_string().contains("pan"));
    }
}
