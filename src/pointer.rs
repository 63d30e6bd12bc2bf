use std::collections::VecDeque;

use log::trace;
use rand::Rng;

use crate::color::{generate_color, wrap, DyeColor};

pub const MAX_POINTERS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contact {
    Mouse,
    Touch(u64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Press { contact: Contact, x: f32, y: f32 },
    Move { contact: Contact, x: f32, y: f32 },
    Release { contact: Contact },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointer {
    pub contact: Option<Contact>,
    pub texcoord: [f32; 2],
    pub prev_texcoord: [f32; 2],
    pub delta: [f32; 2],
    pub down: bool,
    pub moved: bool,
    pub color: DyeColor,
    placed: bool,
}

impl Pointer {
    fn new(contact: Option<Contact>, color: DyeColor) -> Self {
        Self {
            contact,
            texcoord: [0.0; 2],
            prev_texcoord: [0.0; 2],
            delta: [0.0; 2],
            down: false,
            moved: false,
            color,
            placed: false,
        }
    }

    fn press(&mut self, contact: Contact, texcoord: [f32; 2], color: DyeColor) {
        self.contact = Some(contact);
        self.down = true;
        self.moved = false;
        self.texcoord = texcoord;
        self.prev_texcoord = texcoord;
        self.delta = [0.0; 2];
        self.color = color;
        self.placed = true;
    }

    fn move_to(&mut self, texcoord: [f32; 2], (width, height): (u32, u32)) {
        if !self.placed {
            // No previous position to measure a delta against.
            self.texcoord = texcoord;
            self.prev_texcoord = texcoord;
            self.placed = true;
            return;
        }
        self.prev_texcoord = self.texcoord;
        self.texcoord = texcoord;

        let aspect = width.max(1) as f32 / height.max(1) as f32;
        let mut dx = self.texcoord[0] - self.prev_texcoord[0];
        let mut dy = self.texcoord[1] - self.prev_texcoord[1];
        if aspect < 1.0 {
            dx *= aspect;
        }
        if aspect > 1.0 {
            dy /= aspect;
        }
        self.delta = [dx, dy];
        self.moved = dx.abs() > 0.0 || dy.abs() > 0.0;
    }
}

/// Converts a pixel position into field space, where y points up.
pub fn to_texcoord(x: f32, y: f32, (width, height): (u32, u32)) -> [f32; 2] {
    [x / width.max(1) as f32, 1.0 - y / height.max(1) as f32]
}

#[derive(Debug, Clone)]
pub struct PointerTracker {
    pointers: Vec<Pointer>,
    color_timer: f32,
}

impl PointerTracker {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            pointers: vec![Pointer::new(Some(Contact::Mouse), generate_color(rng))],
            color_timer: 0.0,
        }
    }

    pub fn pointers(&self) -> &[Pointer] {
        &self.pointers
    }

    pub fn apply<R: Rng + ?Sized>(&mut self, event: InputEvent, surface: (u32, u32), rng: &mut R) {
        match event {
            InputEvent::Press { contact, x, y } => {
                let color = generate_color(rng);
                match self.slot_for_press(contact) {
                    Some(index) => self.pointers[index].press(contact, to_texcoord(x, y, surface), color),
                    None => trace!("Ignoring {:?}: all {} pointers in use", contact, MAX_POINTERS),
                }
            }
            InputEvent::Move { contact, x, y } => {
                if let Some(index) = self.find(contact) {
                    self.pointers[index].move_to(to_texcoord(x, y, surface), surface);
                }
            }
            InputEvent::Release { contact } => {
                if let Some(index) = self.find(contact) {
                    let pointer = &mut self.pointers[index];
                    pointer.down = false;
                    if index > 0 {
                        pointer.contact = None;
                    }
                }
            }
        }
    }

    fn find(&self, contact: Contact) -> Option<usize> {
        match contact {
            Contact::Mouse => Some(0),
            Contact::Touch(_) => self
                .pointers
                .iter()
                .skip(1)
                .position(|p| p.contact == Some(contact))
                .map(|i| i + 1),
        }
    }

    fn slot_for_press(&mut self, contact: Contact) -> Option<usize> {
        if let Some(index) = self.find(contact) {
            return Some(index);
        }
        if let Some(free) = self.pointers.iter().skip(1).position(|p| p.contact.is_none()) {
            return Some(free + 1);
        }
        if self.pointers.len() < MAX_POINTERS {
            self.pointers.push(Pointer::new(None, DyeColor::default()));
            return Some(self.pointers.len() - 1);
        }
        None
    }

    pub fn take_moved(&mut self) -> Vec<Pointer> {
        self.pointers
            .iter_mut()
            .filter(|p| p.moved)
            .map(|p| {
                p.moved = false;
                *p
            })
            .collect()
    }

    pub fn update_colors<R: Rng + ?Sized>(&mut self, dt: f32, speed: f32, rng: &mut R) -> bool {
        self.color_timer += dt * speed;
        if self.color_timer < 1.0 {
            return false;
        }
        self.color_timer = wrap(self.color_timer, 0.0, 1.0);
        for pointer in &mut self.pointers {
            pointer.color = generate_color(rng);
        }
        true
    }

    pub fn color_timer(&self) -> f32 {
        self.color_timer
    }
}

#[derive(Debug, Default)]
pub struct InputQueue {
    events: VecDeque<InputEvent>,
    detached: bool,
}

impl InputQueue {
    pub fn push(&mut self, event: InputEvent) -> bool {
        if self.detached {
            return false;
        }
        self.events.push_back(event);
        true
    }

    pub fn drain(&mut self) -> impl Iterator<Item = InputEvent> + '_ {
        self.events.drain(..)
    }

    pub fn detach(&mut self) {
        self.detached = true;
        self.events.clear();
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tracker() -> (PointerTracker, StdRng) {
        let mut rng = StdRng::seed_from_u64(7);
        (PointerTracker::new(&mut rng), rng)
    }

    #[test]
    fn press_flips_y_and_resets_delta() {
        let (mut tracker, mut rng) = tracker();
        tracker.apply(
            InputEvent::Press {
                contact: Contact::Mouse,
                x: 50.0,
                y: 25.0,
            },
            (200, 100),
            &mut rng,
        );
        let p = tracker.pointers()[0];
        assert!(p.down);
        assert!(!p.moved);
        assert_eq!(p.texcoord, [0.25, 0.75]);
        assert_eq!(p.prev_texcoord, p.texcoord);
        assert_eq!(p.delta, [0.0, 0.0]);
    }

    #[test]
    fn wide_surface_scales_vertical_delta() {
        let (mut tracker, mut rng) = tracker();
        let surface = (200, 100);
        let press = InputEvent::Press {
            contact: Contact::Mouse,
            x: 100.0,
            y: 50.0,
        };
        tracker.apply(press, surface, &mut rng);
        tracker.apply(
            InputEvent::Move {
                contact: Contact::Mouse,
                x: 120.0,
                y: 40.0,
            },
            surface,
            &mut rng,
        );
        let p = tracker.pointers()[0];
        assert!(p.moved);
        assert!((p.delta[0] - 0.1).abs() < 1e-6);
        assert!((p.delta[1] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn tall_surface_scales_horizontal_delta() {
        let (mut tracker, mut rng) = tracker();
        let surface = (100, 200);
        for (x, y) in [(50.0, 100.0), (70.0, 80.0)] {
            let event = InputEvent::Move {
                contact: Contact::Mouse,
                x,
                y,
            };
            tracker.apply(event, surface, &mut rng);
        }
        let p = tracker.pointers()[0];
        assert!((p.delta[0] - 0.1).abs() < 1e-6);
        assert!((p.delta[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn zero_delta_is_not_a_move() {
        let (mut tracker, mut rng) = tracker();
        let at = |x| InputEvent::Move {
            contact: Contact::Mouse,
            x,
            y: 10.0,
        };
        tracker.apply(at(10.0), (100, 100), &mut rng);
        tracker.apply(at(10.0), (100, 100), &mut rng);
        assert!(!tracker.pointers()[0].moved);
        assert!(tracker.take_moved().is_empty());

        tracker.apply(at(12.0), (100, 100), &mut rng);
        assert_eq!(tracker.take_moved().len(), 1);
        assert!(tracker.take_moved().is_empty());
    }

    #[test]
    fn touches_get_their_own_pointers_and_free_slots_are_reused() {
        let (mut tracker, mut rng) = tracker();
        let press = |id| InputEvent::Press {
            contact: Contact::Touch(id),
            x: 1.0,
            y: 1.0,
        };
        tracker.apply(press(10), (100, 100), &mut rng);
        tracker.apply(press(11), (100, 100), &mut rng);
        assert_eq!(tracker.pointers().len(), 3);

        tracker.apply(
            InputEvent::Release {
                contact: Contact::Touch(10),
            },
            (100, 100),
            &mut rng,
        );
        assert_eq!(tracker.pointers()[1].contact, None);
        assert!(!tracker.pointers()[1].down);

        tracker.apply(press(12), (100, 100), &mut rng);
        assert_eq!(tracker.pointers().len(), 3);
        assert_eq!(tracker.pointers()[1].contact, Some(Contact::Touch(12)));
    }

    #[test]
    fn capacity_is_bounded() {
        let (mut tracker, mut rng) = tracker();
        for id in 0..20 {
            let event = InputEvent::Press {
                contact: Contact::Touch(id),
                x: 0.0,
                y: 0.0,
            };
            tracker.apply(event, (10, 10), &mut rng);
        }
        assert_eq!(tracker.pointers().len(), MAX_POINTERS);
        assert_eq!(tracker.pointers()[0].contact, Some(Contact::Mouse));
    }

    #[test]
    fn moves_of_unknown_touches_are_ignored() {
        let (mut tracker, mut rng) = tracker();
        let event = InputEvent::Move {
            contact: Contact::Touch(3),
            x: 5.0,
            y: 5.0,
        };
        tracker.apply(event, (10, 10), &mut rng);
        assert_eq!(tracker.pointers().len(), 1);
    }

    #[test]
    fn color_timer_wraps_and_recolors() {
        let (mut tracker, mut rng) = tracker();
        let before = tracker.pointers()[0].color;
        assert!(!tracker.update_colors(0.05, 10.0, &mut rng));
        assert!(tracker.update_colors(0.07, 10.0, &mut rng));
        assert!((tracker.color_timer() - 0.2).abs() < 1e-4);
        assert_ne!(tracker.pointers()[0].color, before);
    }

    #[test]
    fn detached_queue_drops_events() {
        let mut queue = InputQueue::default();
        let event = InputEvent::Release {
            contact: Contact::Mouse,
        };
        assert!(queue.push(event));
        assert_eq!(queue.drain().count(), 1);
        assert_eq!(queue.drain().count(), 0);

        queue.push(event);
        queue.detach();
        assert_eq!(queue.drain().count(), 0);
        assert!(!queue.push(event));
        assert!(queue.is_detached());
    }
}
