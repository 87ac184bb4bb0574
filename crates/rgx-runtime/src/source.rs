use std::collections::VecDeque;

use rgx_schemas::OrderIntent;

/// Where the session pulls its next desired order from. One intent per step.
pub trait IntentSource {
    fn next_intent(&mut self) -> Option<OrderIntent>;
}

impl IntentSource for VecDeque<OrderIntent> {
    fn next_intent(&mut self) -> Option<OrderIntent> {
        self.pop_front()
    }
}
