//! Transition rules for a single bargain.
//!
//! Every function here takes the current authoritative record and returns a
//! new one; the input is never touched, so a refused action leaves the stored
//! bargain exactly as it was. Persisting the result is the store's job.

use chrono::{DateTime, Utc};

use crate::error::{BargainError, BargainResult};
use crate::models::{Actor, Bargain, BargainMessage, BargainStatus, Party};

/// The closed set of things that may happen to a bargain.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PostMessage { actor: Actor, text: String },
    AcceptLastOffer { actor: Actor },
    RejectLastOffer { actor: Actor },
    ConfirmDealDone { actor: Actor },
    /// Sent by checkout once the agreed price has been paid.
    MarkCompleted,
}

impl Command {
    pub fn actor(&self) -> Option<&Actor> {
        match self {
            Command::PostMessage { actor, .. }
            | Command::AcceptLastOffer { actor }
            | Command::RejectLastOffer { actor }
            | Command::ConfirmDealDone { actor } => Some(actor),
            Command::MarkCompleted => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::PostMessage { .. } => "post_message",
            Command::AcceptLastOffer { .. } => "accept_last_offer",
            Command::RejectLastOffer { .. } => "reject_last_offer",
            Command::ConfirmDealDone { .. } => "confirm_deal_done",
            Command::MarkCompleted => "mark_completed",
        }
    }
}

/// What a successful command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing changed; no notification is due.
    Unchanged,
    MessagePosted,
    Accepted,
    Rejected,
    /// One side confirmed; still waiting for the other.
    Confirmed,
    /// Price became binding. Publish it to the cart.
    Agreed,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub bargain: Bargain,
    pub effect: Effect,
}

impl Transition {
    fn changed(mut bargain: Bargain, effect: Effect) -> Self {
        bargain.revision += 1;
        Self { bargain, effect }
    }

    fn unchanged(bargain: &Bargain) -> Self {
        Self {
            bargain: bargain.clone(),
            effect: Effect::Unchanged,
        }
    }
}

pub fn apply(current: &Bargain, command: &Command, now: DateTime<Utc>) -> BargainResult<Transition> {
    if let Some(actor) = command.actor() {
        if !current.involves(actor) {
            return Err(BargainError::NotParticipant {
                id: current.id,
                user_id: actor.user_id,
                party: actor.party,
            });
        }
    }

    match command {
        Command::PostMessage { actor, text } => post_message(current, actor.party, text, now),
        Command::AcceptLastOffer { actor } => accept_last_offer(current, actor.party, now),
        Command::RejectLastOffer { actor } => reject_last_offer(current, actor.party, now),
        Command::ConfirmDealDone { actor } => confirm_deal_done(current, actor.party),
        Command::MarkCompleted => mark_completed(current),
    }
}

/// First run of ASCII digits in `text`, read as a price.
pub fn extract_offer(text: &str) -> Option<i64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: &str = &text[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

pub fn post_message(
    current: &Bargain,
    sender: Party,
    text: &str,
    now: DateTime<Utc>,
) -> BargainResult<Transition> {
    require_status(current, "post a message", &[BargainStatus::Pending, BargainStatus::Accepted])?;
    let text = text.trim();
    if text.is_empty() {
        return Err(BargainError::EmptyMessage);
    }

    let mut next = current.clone();
    next.messages.push(BargainMessage {
        sender,
        message: text.to_string(),
        offer: extract_offer(text),
        timestamp: now,
    });
    Ok(Transition::changed(next, Effect::MessagePosted))
}

/// The counter-party's latest offer, which is the only thing `actor` may answer.
fn answerable_offer(current: &Bargain, actor: Party, action: &'static str) -> BargainResult<i64> {
    require_status(current, action, &[BargainStatus::Pending])?;
    let last = current.last_offer().ok_or(BargainError::NoQualifyingOffer)?;
    if last.sender == actor {
        return Err(BargainError::SelfAcceptance(actor));
    }
    last.offer.ok_or(BargainError::NoQualifyingOffer)
}

pub fn accept_last_offer(
    current: &Bargain,
    actor: Party,
    now: DateTime<Utc>,
) -> BargainResult<Transition> {
    let price = answerable_offer(current, actor, "accept an offer")?;

    let mut next = current.clone();
    next.final_price = Some(price);
    match actor {
        Party::Vendor => next.vendor_accepted = true,
        Party::Supplier => next.supplier_accepted = true,
    }
    next.accepted_by = Some(actor);
    next.status = BargainStatus::Accepted;
    next.messages.push(BargainMessage {
        sender: actor,
        message: format!("Accepted at ₹{}", price),
        offer: None,
        timestamp: now,
    });
    Ok(Transition::changed(next, Effect::Accepted))
}

pub fn reject_last_offer(
    current: &Bargain,
    actor: Party,
    now: DateTime<Utc>,
) -> BargainResult<Transition> {
    let price = answerable_offer(current, actor, "reject an offer")?;

    let mut next = current.clone();
    next.status = BargainStatus::Rejected;
    next.vendor_accepted = false;
    next.supplier_accepted = false;
    next.final_price = None;
    // Last entry on the timeline; post_message refuses from here on.
    next.messages.push(BargainMessage {
        sender: actor,
        message: format!("Rejected offer ₹{}", price),
        offer: None,
        timestamp: now,
    });
    Ok(Transition::changed(next, Effect::Rejected))
}

/// Acceptance already counts as the acceptor's confirmation, so a single
/// confirmation from the other side makes the price binding. The acceptor may
/// still record its own flag, which never finalizes on its own.
pub fn confirm_deal_done(current: &Bargain, actor: Party) -> BargainResult<Transition> {
    if current.deal_done_flag(actor)
        && matches!(
            current.status,
            BargainStatus::Accepted | BargainStatus::Agreed | BargainStatus::Completed
        )
    {
        return Ok(Transition::unchanged(current));
    }
    require_status(current, "confirm the deal", &[BargainStatus::Accepted])?;
    if current.final_price.is_none() {
        return Err(BargainError::InvalidStateForAction {
            action: "confirm the deal",
            status: current.status,
        });
    }

    let mut next = current.clone();
    if current.accepted_by.is_some() && current.accepted_by != Some(actor) {
        next.vendor_deal_done = true;
        next.supplier_deal_done = true;
    } else {
        match actor {
            Party::Vendor => next.vendor_deal_done = true,
            Party::Supplier => next.supplier_deal_done = true,
        }
    }

    if next.vendor_deal_done && next.supplier_deal_done {
        next.status = BargainStatus::Agreed;
        Ok(Transition::changed(next, Effect::Agreed))
    } else {
        Ok(Transition::changed(next, Effect::Confirmed))
    }
}

pub fn mark_completed(current: &Bargain) -> BargainResult<Transition> {
    match current.status {
        BargainStatus::Completed => Ok(Transition::unchanged(current)),
        BargainStatus::Agreed => {
            let mut next = current.clone();
            next.status = BargainStatus::Completed;
            Ok(Transition::changed(next, Effect::Completed))
        }
        status => Err(BargainError::InvalidStateForAction {
            action: "complete the purchase",
            status,
        }),
    }
}

fn require_status(
    current: &Bargain,
    action: &'static str,
    allowed: &[BargainStatus],
) -> BargainResult<()> {
    if allowed.contains(&current.status) {
        Ok(())
    } else {
        Err(BargainError::InvalidStateForAction {
            action,
            status: current.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewBargain;

    const VENDOR: Actor = Actor { user_id: 1, party: Party::Vendor };
    const SUPPLIER: Actor = Actor { user_id: 2, party: Party::Supplier };

    fn fresh() -> Bargain {
        Bargain::open(
            1,
            NewBargain {
                product_id: 10,
                product_name: "Organic Tomatoes".into(),
                supplier_id: SUPPLIER.user_id,
                supplier_name: "Sakshi".into(),
                vendor_id: VENDOR.user_id,
                vendor_name: "Manya".into(),
                original_price: 60.0,
                quantity: 25.0,
                unit: "kg".into(),
            },
            Utc::now(),
        )
    }

    fn run(b: &Bargain, cmd: Command) -> BargainResult<Bargain> {
        let t = apply(b, &cmd, Utc::now())?;
        t.bargain.check_invariants().expect("invariants hold");
        Ok(t.bargain)
    }

    fn say(b: &Bargain, actor: Actor, text: &str) -> Bargain {
        run(b, Command::PostMessage { actor, text: text.into() }).unwrap()
    }

    #[test]
    fn test_extract_offer() {
        assert_eq!(extract_offer("Can you do 50?"), Some(50));
        assert_eq!(extract_offer("250"), Some(250));
        assert_eq!(extract_offer("80 or 90"), Some(80));
        assert_eq!(extract_offer("hello"), None);
        assert_eq!(extract_offer("₹45/kg"), Some(45));
        assert_eq!(extract_offer("99999999999999999999999"), None);
    }

    #[test]
    fn test_scenario_a_supplier_accepts_vendor_offer() {
        let b = say(&fresh(), VENDOR, "Can you do 50?");
        assert_eq!(b.messages[0].offer, Some(50));

        let b = run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap();
        assert_eq!(b.status, BargainStatus::Accepted);
        assert_eq!(b.final_price, Some(50));
        assert_eq!(b.accepted_by, Some(Party::Supplier));
        assert!(b.supplier_accepted);
        assert!(!b.vendor_accepted);
        assert_eq!(b.messages.last().unwrap().message, "Accepted at ₹50");
        assert_eq!(b.messages.last().unwrap().offer, None);
    }

    #[test]
    fn test_scenario_b_fast_path_confirmation() {
        let b = say(&fresh(), VENDOR, "Can you do 50?");
        let b = run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap();

        let t = apply(&b, &Command::ConfirmDealDone { actor: VENDOR }, Utc::now()).unwrap();
        assert_eq!(t.effect, Effect::Agreed);
        assert_eq!(t.bargain.status, BargainStatus::Agreed);
        assert!(t.bargain.vendor_deal_done && t.bargain.supplier_deal_done);
        assert_eq!(t.bargain.final_price, Some(50));
    }

    #[test]
    fn test_scenario_c_accept_counter_offer() {
        let b = say(&fresh(), VENDOR, "50");
        let b = say(&b, SUPPLIER, "Best I can do is 80");
        let b = run(&b, Command::AcceptLastOffer { actor: VENDOR }).unwrap();
        assert_eq!(b.final_price, Some(80));
        assert_eq!(b.accepted_by, Some(Party::Vendor));
    }

    #[test]
    fn test_scenario_d_reject_is_terminal() {
        let b = say(&fresh(), VENDOR, "50");
        let b = run(&b, Command::RejectLastOffer { actor: SUPPLIER }).unwrap();
        assert_eq!(b.status, BargainStatus::Rejected);
        assert_eq!(b.final_price, None);
        assert!(!b.vendor_accepted && !b.supplier_accepted);
        assert_eq!(b.messages.last().unwrap().message, "Rejected offer ₹50");

        for actor in [VENDOR, SUPPLIER] {
            let err = run(&b, Command::PostMessage { actor, text: "60?".into() }).unwrap_err();
            assert!(matches!(err, BargainError::InvalidStateForAction { .. }));
        }
    }

    #[test]
    fn test_self_acceptance_refused() {
        let b = say(&fresh(), VENDOR, "Can you do 50?");
        let err = run(&b, Command::AcceptLastOffer { actor: VENDOR }).unwrap_err();
        assert_eq!(err, BargainError::SelfAcceptance(Party::Vendor));
        let err = run(&b, Command::RejectLastOffer { actor: VENDOR }).unwrap_err();
        assert_eq!(err, BargainError::SelfAcceptance(Party::Vendor));
    }

    #[test]
    fn test_plain_chat_does_not_shift_offer_ownership() {
        let b = say(&fresh(), VENDOR, "Can you do 50?");
        let b = say(&b, SUPPLIER, "hmm, let me think");
        // Last offer is still the vendor's, so only the supplier may answer it.
        assert!(run(&b, Command::AcceptLastOffer { actor: VENDOR }).is_err());
        assert!(run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).is_ok());
    }

    #[test]
    fn test_no_offer_to_accept() {
        let b = say(&fresh(), VENDOR, "hello there");
        assert_eq!(
            run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap_err(),
            BargainError::NoQualifyingOffer
        );
        assert_eq!(
            run(&fresh(), Command::RejectLastOffer { actor: SUPPLIER }).unwrap_err(),
            BargainError::NoQualifyingOffer
        );
    }

    #[test]
    fn test_failed_action_leaves_record_untouched() {
        let b = say(&fresh(), VENDOR, "50");
        let before = b.clone();
        let _ = apply(&b, &Command::AcceptLastOffer { actor: VENDOR }, Utc::now());
        assert_eq!(b, before);
    }

    #[test]
    fn test_empty_message_refused() {
        assert_eq!(
            run(&fresh(), Command::PostMessage { actor: VENDOR, text: "   ".into() }).unwrap_err(),
            BargainError::EmptyMessage
        );
    }

    #[test]
    fn test_outsider_refused() {
        let stranger = Actor::vendor(99);
        let err = run(&fresh(), Command::PostMessage { actor: stranger, text: "50".into() })
            .unwrap_err();
        assert!(matches!(err, BargainError::NotParticipant { user_id: 99, .. }));
    }

    #[test]
    fn test_accumulation_path_waits_for_counterparty() {
        let b = say(&fresh(), VENDOR, "50");
        let b = run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap();

        let t = apply(&b, &Command::ConfirmDealDone { actor: SUPPLIER }, Utc::now()).unwrap();
        assert_eq!(t.effect, Effect::Confirmed);
        assert_eq!(t.bargain.status, BargainStatus::Accepted);
        assert!(t.bargain.supplier_deal_done);

        let again = apply(&t.bargain, &Command::ConfirmDealDone { actor: SUPPLIER }, Utc::now())
            .unwrap();
        assert_eq!(again.effect, Effect::Unchanged);

        let done = apply(&t.bargain, &Command::ConfirmDealDone { actor: VENDOR }, Utc::now())
            .unwrap();
        assert_eq!(done.effect, Effect::Agreed);
        assert_eq!(done.bargain.final_price, Some(50));
    }

    #[test]
    fn test_confirm_requires_acceptance() {
        let b = say(&fresh(), VENDOR, "50");
        let err = run(&b, Command::ConfirmDealDone { actor: SUPPLIER }).unwrap_err();
        assert!(matches!(
            err,
            BargainError::InvalidStateForAction { status: BargainStatus::Pending, .. }
        ));
    }

    #[test]
    fn test_agreed_is_frozen() {
        let b = say(&fresh(), VENDOR, "50");
        let b = run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap();
        let b = run(&b, Command::ConfirmDealDone { actor: VENDOR }).unwrap();

        assert!(run(&b, Command::PostMessage { actor: SUPPLIER, text: "70".into() }).is_err());
        assert!(run(&b, Command::AcceptLastOffer { actor: VENDOR }).is_err());
        assert!(run(&b, Command::RejectLastOffer { actor: VENDOR }).is_err());
        let t = apply(&b, &Command::ConfirmDealDone { actor: SUPPLIER }, Utc::now()).unwrap();
        assert_eq!(t.effect, Effect::Unchanged);
        assert_eq!(t.bargain, b);
    }

    #[test]
    fn test_mark_completed() {
        let b = say(&fresh(), VENDOR, "50");
        assert!(run(&b, Command::MarkCompleted).is_err());

        let b = run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap();
        let b = run(&b, Command::ConfirmDealDone { actor: VENDOR }).unwrap();
        let t = apply(&b, &Command::MarkCompleted, Utc::now()).unwrap();
        assert_eq!(t.effect, Effect::Completed);
        assert_eq!(t.bargain.status, BargainStatus::Completed);
        assert_eq!(t.bargain.final_price, Some(50));

        let t2 = apply(&t.bargain, &Command::MarkCompleted, Utc::now()).unwrap();
        assert_eq!(t2.effect, Effect::Unchanged);
    }

    #[test]
    fn test_rejected_stays_rejected() {
        let b = say(&fresh(), VENDOR, "50");
        let b = run(&b, Command::RejectLastOffer { actor: SUPPLIER }).unwrap();
        let commands = [
            Command::AcceptLastOffer { actor: VENDOR },
            Command::AcceptLastOffer { actor: SUPPLIER },
            Command::RejectLastOffer { actor: VENDOR },
            Command::ConfirmDealDone { actor: VENDOR },
            Command::ConfirmDealDone { actor: SUPPLIER },
            Command::MarkCompleted,
        ];
        for cmd in commands {
            assert!(apply(&b, &cmd, Utc::now()).is_err(), "{} should fail", cmd.name());
        }
    }

    #[test]
    fn test_revision_bumps_only_on_change() {
        let b = say(&fresh(), VENDOR, "50");
        assert_eq!(b.revision, 1);
        let b = run(&b, Command::AcceptLastOffer { actor: SUPPLIER }).unwrap();
        assert_eq!(b.revision, 2);
        let b = run(&b, Command::ConfirmDealDone { actor: VENDOR }).unwrap();
        assert_eq!(b.revision, 3);
        let b = run(&b, Command::ConfirmDealDone { actor: VENDOR }).unwrap();
        assert_eq!(b.revision, 3);
    }
}
