//! Stepper-motor controller for the antenna sweep used during data
//! collection. The motor is geared one STEP pulse per degree; pulses are
//! 40 ms high / 40 ms low, and the DIR line low means positive rotation.

use crate::Clock;

/// STEP/DIR line access, one implementation per board; tests record pulses.
pub trait StepperPins {
    /// Drive the DIR line. `reverse` = rotate toward smaller angles.
    fn set_direction(&mut self, reverse: bool);
    fn set_step(&mut self, high: bool);
}

/// How the sweep progresses across rounds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepMode {
    /// Rotate continuously in one direction; the angle grows without bound
    /// and a full-rotation counter ticks every 360 degrees.
    Wrap,
    /// Sweep up to 360 degrees and back down to zero, reversing at the
    /// ends.
    Bounce,
}

pub struct Rotator<P: StepperPins> {
    pins: P,
    mode: SweepMode,
    /// Completed ranging rounds per one-degree step.
    pub rounds_per_degree: u16,
    angle: u16,
    direction: i8,
    full_rotations: u8,
}

impl<P: StepperPins> Rotator<P> {
    pub fn new(pins: P, mode: SweepMode, rounds_per_degree: u16) -> Self {
        Self {
            pins,
            mode,
            rounds_per_degree,
            angle: 0,
            direction: 1,
            full_rotations: 0,
        }
    }

    /// Current angle in degrees. In wrap mode this keeps growing past 360.
    pub fn angle(&self) -> u16 {
        self.angle
    }

    pub fn full_rotations(&self) -> u8 {
        self.full_rotations
    }

    /// Advance the sweep by one degree and pulse the motor accordingly.
    pub fn advance(&mut self, clock: &mut impl Clock) {
        match self.mode {
            SweepMode::Wrap => {
                if self.angle > 0 && self.angle % 360 == 0 {
                    self.full_rotations = self.full_rotations.wrapping_add(1);
                }
                self.angle = self.angle.wrapping_add(1);
            }
            SweepMode::Bounce => {
                if self.angle == 0 {
                    self.direction = 1;
                    self.angle += 1;
                } else if self.angle == 360 {
                    self.direction = -1;
                    self.angle -= 1;
                    self.full_rotations = self.full_rotations.wrapping_add(1);
                } else if self.direction > 0 {
                    self.angle += 1;
                } else {
                    self.angle -= 1;
                }
            }
        }
        self.step(self.direction, clock);
    }

    /// Emit one pulse per degree; the sign of `degrees` selects the
    /// direction.
    fn step(&mut self, degrees: i8, clock: &mut impl Clock) {
        if degrees == 0 {
            return;
        }
        self.pins.set_direction(degrees < 0);

        for _ in 0..degrees.unsigned_abs() {
            self.pins.set_step(true);
            clock.sleep_ms(40);
            self.pins.set_step(false);
            clock.sleep_ms(40);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct PinLog {
        dir_states: Vec<bool>,
        step_edges: Vec<bool>,
    }

    #[derive(Clone, Default)]
    struct MockPins(Rc<RefCell<PinLog>>);

    impl StepperPins for MockPins {
        fn set_direction(&mut self, reverse: bool) {
            self.0.borrow_mut().dir_states.push(reverse);
        }
        fn set_step(&mut self, high: bool) {
            self.0.borrow_mut().step_edges.push(high);
        }
    }

    #[derive(Default)]
    struct MockClock {
        slept: Vec<u32>,
    }

    impl Clock for MockClock {
        fn ticks_ms(&self) -> u32 {
            self.slept.iter().sum()
        }
        fn sleep_ms(&mut self, ms: u32) {
            self.slept.push(ms);
        }
    }

    #[test]
    fn one_degree_is_one_pulse_with_40ms_edges() {
        let pins = MockPins::default();
        let mut clock = MockClock::default();
        let mut rot = Rotator::new(pins.clone(), SweepMode::Wrap, 5);

        rot.advance(&mut clock);

        let log = pins.0.borrow();
        assert_eq!(log.dir_states, vec![false]); // positive rotation: DIR low
        assert_eq!(log.step_edges, vec![true, false]);
        assert_eq!(clock.slept, vec![40, 40]);
        assert_eq!(rot.angle(), 1);
    }

    #[test]
    fn wrap_mode_counts_full_rotations() {
        let pins = MockPins::default();
        let mut clock = MockClock::default();
        let mut rot = Rotator::new(pins, SweepMode::Wrap, 1);

        for _ in 0..721 {
            rot.advance(&mut clock);
        }
        // Angle is monotone; the counter ticked at 360 and 720.
        assert_eq!(rot.angle(), 721);
        assert_eq!(rot.full_rotations(), 2);
    }

    #[test]
    fn bounce_mode_reverses_at_the_ends() {
        let pins = MockPins::default();
        let mut clock = MockClock::default();
        let mut rot = Rotator::new(pins.clone(), SweepMode::Bounce, 1);

        for _ in 0..360 {
            rot.advance(&mut clock);
        }
        assert_eq!(rot.angle(), 360);
        assert_eq!(rot.full_rotations(), 0);

        // Hitting 360 turns around and counts the completed sweep.
        rot.advance(&mut clock);
        assert_eq!(rot.angle(), 359);
        assert_eq!(rot.full_rotations(), 1);
        assert!(*pins.0.borrow().dir_states.last().unwrap()); // DIR high now

        for _ in 0..359 {
            rot.advance(&mut clock);
        }
        assert_eq!(rot.angle(), 0);

        // And from zero it climbs again.
        rot.advance(&mut clock);
        assert_eq!(rot.angle(), 1);
        assert!(!*pins.0.borrow().dir_states.last().unwrap());
    }
}
