use crate::Event;
use futures::channel::mpsc;

/// Subscribers to a stream of [Event]s.
///
/// Events are delivered to every subscriber in publication order. Subscribers that dropped their
/// receiver are pruned on the next publication.
#[derive(Default)]
pub(crate) struct Listeners {
    senders: Vec<mpsc::UnboundedSender<Event>>,
}

impl Listeners {
    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded();
        self.senders.push(sender);
        receiver
    }

    pub(crate) fn publish(&mut self, event: Event) {
        self.senders
            .retain(|sender| sender.unbounded_send(event.clone()).is_ok());
    }
}
