// Session tickets for the public imagine/video surface
//
// A ticket is created by an authenticated POST and consumed by the follow-up
// SSE connection, keeping long-lived credentials out of URLs. Tickets are
// single-use and expire after `session.ticket_ttl_sec`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketParams {
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: String,
    #[serde(default = "default_count")]
    pub n: u32,
    #[serde(default)]
    pub response_format: String,
    #[serde(default)]
    pub nsfw: bool,
}

fn default_count() -> u32 {
    1
}

struct Ticket {
    params: TicketParams,
    created_at: Instant,
}

pub struct TicketStore {
    tickets: Mutex<HashMap<String, Ticket>>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs.max(1)),
        }
    }

    fn purge_expired(&self, tickets: &mut HashMap<String, Ticket>) {
        let ttl = self.ttl;
        tickets.retain(|_, t| t.created_at.elapsed() < ttl);
    }

    /// Issue a new single-use ticket id.
    pub fn create(&self, params: TicketParams) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut tickets = self.tickets.lock().expect("ticket lock poisoned");
        self.purge_expired(&mut tickets);
        tickets.insert(
            id.clone(),
            Ticket {
                params,
                created_at: Instant::now(),
            },
        );
        id
    }

    /// Consume a ticket, removing it. None when unknown or expired.
    pub fn consume(&self, id: &str) -> Option<TicketParams> {
        let mut tickets = self.tickets.lock().expect("ticket lock poisoned");
        self.purge_expired(&mut tickets);
        tickets.remove(id).map(|t| t.params)
    }

    /// Drop a ticket without consuming it (client-initiated stop).
    pub fn remove(&self, id: &str) -> bool {
        self.tickets
            .lock()
            .expect("ticket lock poisoned")
            .remove(id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().expect("ticket lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
